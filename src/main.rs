use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use filegate::agentd::AgentOpts;

#[derive(Parser, Debug)]
#[clap(about = "File-integrity and access-control monitor for containers")]
#[clap(version)]
struct Opts {
    #[command(flatten)]
    agent: AgentOpts,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    filegate::init_logger(Some(opts.verbosity.log_level_filter()));

    match filegate::agentd::run(&opts.agent).await {
        Ok(()) => Ok(()),
        Err(e) => {
            filegate::report_error(&e);
            std::process::exit(1);
        }
    }
}
