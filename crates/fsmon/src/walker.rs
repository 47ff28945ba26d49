//! Path walker client.
//!
//! Enumerating a container root is delegated to a [`PathWalker`]
//! collaborator speaking a JSON wire format. The client bounds every
//! request with a timeout and a fixed-capacity semaphore so that at
//! most two container walks are in flight at any time.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use walkdir::WalkDir;

const WALK_TIMEOUT: Duration = Duration::from_secs(16);
const WALKER_MAX_COUNT: usize = 2;

#[derive(Error, Debug)]
pub enum WalkerError {
    #[error("walk request timed out")]
    Timeout,
    #[error("walker task failed: {0}")]
    Task(String),
    #[error("malformed walker response")]
    Malformed(#[from] serde_json::Error),
    #[error("walker is shut down")]
    Closed,
}

/// One enumeration request, rooted at `path` inside the mount
/// namespace of `pid` and restricted to the given base directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkRequest {
    pub pid: i32,
    pub path: String,
    pub dirs: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkedEntry {
    /// Container-side path.
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalkResult {
    pub dirs: Vec<WalkedEntry>,
    pub files: Vec<WalkedEntry>,
}

/// The enumeration collaborator. Runs one walk and returns the
/// serialized [`WalkResult`].
pub trait PathWalker: Send + Sync {
    fn run(&self, req: &WalkRequest) -> Result<Vec<u8>, WalkerError>;
}

/// Client wrapper gating walker access.
pub struct WalkerClient {
    walker: Arc<dyn PathWalker>,
    limiter: Arc<Semaphore>,
}

impl WalkerClient {
    pub fn new(walker: Arc<dyn PathWalker>) -> Self {
        WalkerClient {
            walker,
            limiter: Arc::new(Semaphore::new(WALKER_MAX_COUNT)),
        }
    }

    /// Enumerate the base directories under the container root of
    /// `pid`. Completes with an error on timeout, walker failure or a
    /// malformed response.
    pub async fn walk(&self, pid: i32, dirs: Vec<String>) -> Result<WalkResult, WalkerError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| WalkerError::Closed)?;

        let req = WalkRequest {
            pid,
            path: "/".to_string(),
            dirs,
            timeout_secs: WALK_TIMEOUT.as_secs(),
        };
        let walker = self.walker.clone();
        let bytes = tokio::time::timeout(
            WALK_TIMEOUT,
            tokio::task::spawn_blocking(move || walker.run(&req)),
        )
        .await
        .map_err(|_| WalkerError::Timeout)?
        .map_err(|e| WalkerError::Task(e.to_string()))??;

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// In-process walker over `/proc/<pid>/root`.
///
/// The production deployment may substitute a collaborator that walks
/// from inside the mount namespace; the wire contract is the same.
#[derive(Debug, Default)]
pub struct LocalPathWalker;

impl PathWalker for LocalPathWalker {
    fn run(&self, req: &WalkRequest) -> Result<Vec<u8>, WalkerError> {
        let root = format!("/proc/{}/root", req.pid);
        let mut res = WalkResult::default();

        for dir in &req.dirs {
            let start = format!("{root}{dir}");
            if !Path::new(&start).exists() {
                continue;
            }
            for entry in WalkDir::new(&start)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                let cpath = match entry.path().strip_prefix(&root) {
                    Ok(rel) => format!("/{}", rel.to_string_lossy()),
                    Err(_) => continue,
                };
                let walked = WalkedEntry {
                    path: cpath,
                    mode: meta.permissions().mode(),
                };
                if meta.is_dir() {
                    res.dirs.push(walked);
                } else {
                    res.files.push(walked);
                }
            }
        }

        Ok(serde_json::to_vec(&res)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticWalker(Vec<u8>);

    impl PathWalker for StaticWalker {
        fn run(&self, _req: &WalkRequest) -> Result<Vec<u8>, WalkerError> {
            Ok(self.0.clone())
        }
    }

    struct SlowWalker;

    impl PathWalker for SlowWalker {
        fn run(&self, _req: &WalkRequest) -> Result<Vec<u8>, WalkerError> {
            std::thread::sleep(Duration::from_secs(60));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn walk_parses_the_wire_format() {
        let res = WalkResult {
            dirs: vec![WalkedEntry {
                path: "/bin".to_string(),
                mode: 0o040755,
            }],
            files: vec![WalkedEntry {
                path: "/bin/ls".to_string(),
                mode: 0o100755,
            }],
        };
        let client = WalkerClient::new(Arc::new(StaticWalker(serde_json::to_vec(&res).unwrap())));
        let parsed = client.walk(1, vec!["/bin".to_string()]).await.unwrap();
        assert_eq!(parsed.dirs.len(), 1);
        assert_eq!(parsed.files[0].path, "/bin/ls");
    }

    #[tokio::test]
    async fn malformed_response_is_an_error() {
        let client = WalkerClient::new(Arc::new(StaticWalker(b"not json".to_vec())));
        assert!(matches!(
            client.walk(1, vec![]).await,
            Err(WalkerError::Malformed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_walker_times_out() {
        let client = WalkerClient::new(Arc::new(SlowWalker));
        let walk = client.walk(1, vec![]);
        assert!(matches!(walk.await, Err(WalkerError::Timeout)));
    }

    #[tokio::test]
    async fn local_walker_enumerates_own_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file"), b"x").unwrap();

        let pid = std::process::id() as i32;
        let req = WalkRequest {
            pid,
            path: "/".to_string(),
            dirs: vec![dir.path().to_string_lossy().into_owned()],
            timeout_secs: 16,
        };
        let bytes = LocalPathWalker.run(&req).unwrap();
        let res: WalkResult = serde_json::from_slice(&bytes).unwrap();

        let file = format!("{}/sub/file", dir.path().display());
        assert!(res.files.iter().any(|f| f.path == file));
        assert!(res
            .dirs
            .iter()
            .any(|d| d.path == format!("{}/sub", dir.path().display())));
    }
}
