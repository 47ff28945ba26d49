//! Utility functions used to extract data from procfs, and the
//! `/proc/<pid>/root/<path>` addressing scheme used for files inside
//! container mount namespaces.

use std::fs::{self, File};
use std::io::{self, prelude::*, BufReader};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    /// Pattern for matching cgroups created by Docker.
    static ref RE_CGROUP_DOCKER: Regex =
        Regex::new(r"docker.(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
    /// Pattern for matching cgroups created by libpod/podman.
    static ref RE_CGROUP_LIBPOD: Regex =
        Regex::new(r"libpod(?:-conmon)?-(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
    /// Pattern for the host-side addressing of container files.
    static ref RE_CONTAINER_PATH: Regex = Regex::new(r"^/proc/(\d+)/root(/.*)$").unwrap();
}

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("parent for process {0} not found")]
    ParentNotFound(i32),
    #[error("user id for process {0} not found")]
    UserNotFound(i32),

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Returns the path of the executable image of a given process.
pub fn process_image(pid: i32) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Returns the command name for the given process.
pub fn process_comm(pid: i32) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/comm");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(data.trim().to_owned())
}

/// Returns the command line for the given process.
pub fn process_command_line(pid: i32) -> Result<Vec<String>, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(data
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

/// Returns the parent of a given process.
pub fn process_parent_pid(pid: i32) -> Result<i32, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("PPid:") {
            return Ok(value.trim().parse()?);
        }
    }

    Err(ProcfsError::ParentNotFound(pid))
}

/// Returns the effective user id of a given process.
pub fn process_euid(pid: i32) -> Result<u32, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("Uid:") {
            // Uid: real, effective, saved, filesystem
            if let Some(euid) = value.split_whitespace().nth(1) {
                return Ok(euid.parse()?);
            }
        }
    }

    Err(ProcfsError::UserNotFound(pid))
}

/// Resolves a uid to its login name through /etc/passwd.
pub fn user_name(uid: u32) -> Option<String> {
    let file = File::open("/etc/passwd").ok()?;
    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _passwd = fields.next()?;
        if fields.next()?.parse::<u32>().ok()? == uid {
            return Some(name.to_string());
        }
    }
    None
}

/// Whether the pid still has a procfs entry.
pub fn is_pid_alive(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Host-side path of a file inside the mount namespace of `pid`.
pub fn container_file_path(pid: i32, path: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/root{path}"))
}

/// Recovers `(pid, container_path)` from a host-side path produced by
/// [`container_file_path`]. Returns `None` for any other shape.
pub fn parse_container_file_path(path: &Path) -> Option<(i32, String)> {
    let caps = RE_CONTAINER_PATH.captures(path.to_str()?)?;
    let pid = caps.get(1)?.as_str().parse().ok()?;
    Some((pid, caps.get(2)?.as_str().to_string()))
}

/// Returns the pid-namespace identity of a process, from the
/// `/proc/<pid>/ns/pid` magic link.
pub fn pid_namespace(pid: i32) -> Result<String, ProcfsError> {
    read_link(&format!("/proc/{pid}/ns/pid")).map(|p| p.to_string_lossy().into_owned())
}

/// Host pid of the init process of the container `pid` lives in.
///
/// Climbs the parent chain while the pid namespace stays the same; the
/// last process inside the namespace is the container init. Host
/// processes resolve to 1.
pub fn container_root_pid(pid: i32) -> Option<i32> {
    let ns = pid_namespace(pid).ok()?;
    let mut current = pid;
    // Bounded in case of a parent cycle while processes exit under us.
    for _ in 0..256 {
        if current <= 1 {
            return Some(1);
        }
        let parent = process_parent_pid(current).ok()?;
        if parent == 0 {
            return Some(current);
        }
        match pid_namespace(parent) {
            Ok(parent_ns) if parent_ns == ns => current = parent,
            _ => return Some(current),
        }
    }
    None
}

fn container_id_from_cgroup(cgroup_info: &str) -> Option<String> {
    if let Some(caps) = RE_CGROUP_DOCKER.captures(cgroup_info) {
        return Some(caps.name("id").unwrap().as_str().to_string());
    }
    if let Some(caps) = RE_CGROUP_LIBPOD.captures(cgroup_info) {
        return Some(caps.name("id").unwrap().as_str().to_string());
    }
    None
}

/// Container id of a process, extracted from its cgroup paths.
pub fn process_container_id(pid: i32) -> Result<Option<String>, ProcfsError> {
    if pid == 0 {
        return Ok(None);
    }

    let path = format!("/proc/{pid}/cgroup");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(container_id) = container_id_from_cgroup(&line) {
            return Ok(Some(container_id));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_path_round_trip() {
        let host = container_file_path(42, "/etc/passwd");
        assert_eq!(host, PathBuf::from("/proc/42/root/etc/passwd"));
        assert_eq!(
            parse_container_file_path(&host),
            Some((42, "/etc/passwd".to_string()))
        );
        assert_eq!(parse_container_file_path(Path::new("/etc/passwd")), None);
        assert_eq!(parse_container_file_path(Path::new("/proc/42/rootless")), None);
    }

    #[test]
    fn container_id_from_cgroup_lines() {
        assert_eq!(container_id_from_cgroup("0::/init.scope"), None);

        let id = container_id_from_cgroup(
            "0::/system.slice/docker-14467e1a5a6da17b660a130932f1ab568f35586bac8bc5147987d9bba4da08de.scope",
        );
        assert_eq!(
            id.as_deref(),
            Some("14467e1a5a6da17b660a130932f1ab568f35586bac8bc5147987d9bba4da08de")
        );

        let id = container_id_from_cgroup(
            "0::/machine.slice/libpod-conmon-551ccf517b3394d9b953efeb8296b93451e45c2a8288518e4391d7b1db3cc9ee.scope",
        );
        assert_eq!(
            id.as_deref(),
            Some("551ccf517b3394d9b953efeb8296b93451e45c2a8288518e4391d7b1db3cc9ee")
        );
    }

    #[test]
    fn self_is_alive() {
        let pid = std::process::id() as i32;
        assert!(is_pid_alive(pid));
        assert!(!is_pid_alive(0));
    }
}
