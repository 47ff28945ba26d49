//! Console report sink.
//!
//! The default control plane of a standalone agent: alerts print to
//! the terminal, learned rules go to the log.

use chrono::Utc;

use filegate_core::event::{MonitorAction, MonitorMessage};
use filegate_core::process::{ControlError, ControlPlane};
use filegate_core::profile::AccessRuleReq;

#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ControlPlane for ConsoleReporter {
    fn send_report(&self, msg: MonitorMessage) -> bool {
        let time = Utc::now().format("%Y-%m-%dT%TZ");
        let label = match msg.action {
            MonitorAction::Deny => "\x1b[1;30;41mDENY\x1b[0m   ",
            MonitorAction::Violate => "\x1b[1;30;43mVIOLATE\x1b[0m",
        };
        let source = if msg.id.is_empty() {
            "host"
        } else {
            msg.id.as_str()
        };
        println!(
            "[{time} {label} {source}] [{group}] {path}: {text} ({proc} pid {pid})",
            group = msg.group,
            path = msg.path,
            text = msg.msg,
            proc = if msg.proc_path.is_empty() {
                "unknown process"
            } else {
                &msg.proc_path
            },
            pid = msg.proc_pid,
        );
        true
    }

    fn send_access_rules(&self, rules: Vec<AccessRuleReq>) -> Result<(), ControlError> {
        log::info!("learned {} access rules", rules.len());
        for rule in &rules {
            log::debug!(
                "learned rule: group={} filter={} path={}",
                rule.group,
                rule.filter,
                rule.path
            );
        }
        Ok(())
    }

    fn estimate_rule_source(&self, id: &str, _path: &str, _denied: bool) -> String {
        if id.is_empty() {
            "nodes".to_string()
        } else {
            let short = &id[..id.len().min(12)];
            format!("container.{short}")
        }
    }
}
