//! Watch profiles: which files of a container are monitored, and how.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What to do when a filter matches: record the access, or gate it at
/// the kernel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterBehavior {
    Monitor,
    Block,
}

/// Policy mode of a monitored container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Observe accesses and learn per-filter process rules.
    Learn,
    /// Report violations, never deny.
    Evaluate,
    /// Deny disallowed access at the kernel boundary.
    Enforce,
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learn" => Ok(PolicyMode::Learn),
            "evaluate" => Ok(PolicyMode::Evaluate),
            "enforce" => Ok(PolicyMode::Enforce),
            other => Err(format!("unknown policy mode {other:?}")),
        }
    }
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyMode::Learn => "learn",
            PolicyMode::Evaluate => "evaluate",
            PolicyMode::Enforce => "enforce",
        };
        f.write_str(s)
    }
}

/// One declarative watch target of a profile.
///
/// `path` is a prefix inside the container, possibly with `\.`-escaped
/// dots and a `.*` tail. An empty `regex` means the path is matched
/// exactly; otherwise filenames are matched against the anchored
/// pattern `^<dir>/<regex>$`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    pub path: String,
    pub regex: String,
    pub recursive: bool,
    pub behavior: FilterBehavior,
    pub user_added: bool,
    pub derived_group: String,
}

impl FileFilter {
    pub fn new(path: &str, regex: &str, recursive: bool, behavior: FilterBehavior) -> Self {
        FileFilter {
            path: path.to_string(),
            regex: regex.to_string(),
            recursive,
            behavior,
            user_added: false,
            derived_group: String::new(),
        }
    }

    /// Stable identity of a filter within a profile. The learning engine
    /// and rule updates key on this.
    pub fn key(&self) -> String {
        format!("{}/{}", self.path, self.regex)
    }
}

/// Active profile of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorProfile {
    pub group: String,
    /// Unset means the container has not been assigned a mode yet; the
    /// monitor falls back to `Learn`.
    pub mode: Option<PolicyMode>,
    pub filters: Vec<FileFilter>,
    /// Filters pushed through custom resources, enumerated and learned
    /// exactly like `filters`.
    pub crd_filters: Vec<FileFilter>,
}

impl MonitorProfile {
    /// All filters of the profile, customer and CRD alike.
    pub fn all_filters(&self) -> impl Iterator<Item = &FileFilter> {
        self.filters.iter().chain(self.crd_filters.iter())
    }
}

/// Allowed process list for one filter, as applied by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRule {
    pub apps: Vec<String>,
    pub user_added: bool,
}

/// Per-container access-rule set, keyed by filter key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRuleSet {
    pub filters: HashMap<String, AccessRule>,
}

/// One learned rule shipped to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRuleReq {
    pub group: String,
    pub filter: String,
    pub path: String,
}

/// Files the container runtime itself writes when a container starts.
/// Events on these are suppressed while the container is young.
pub fn is_runtime_added_file(path: &str) -> bool {
    path.ends_with("/root/etc/hosts")
        || path.ends_with("/root/etc/hostname")
        || path.ends_with("/root/etc/resolv.conf")
}

const PACKAGE_DB_PATHS: &[&str] = &[
    "/var/lib/dpkg/status",
    "/var/lib/rpm/Packages",
    "/var/lib/rpm/Packages.db",
    "/lib/apk/db/installed",
];

/// Whether a container path belongs to a package-manager database.
pub fn is_package_path(path: &str) -> bool {
    PACKAGE_DB_PATHS.iter().any(|db| path.ends_with(db))
}

/// The stock profile applied to containers that have no custom one:
/// package databases, credential files, the dynamic loader and libc,
/// and the binary directories.
pub fn default_profile() -> MonitorProfile {
    use FilterBehavior::Monitor;

    let filters = vec![
        FileFilter::new("/var/lib/dpkg/status", "", false, Monitor),
        FileFilter::new("/var/lib/rpm/Packages", "", false, Monitor),
        FileFilter::new("/var/lib/rpm/Packages.db", "", false, Monitor),
        FileFilter::new("/lib/apk/db/installed", "", false, Monitor),
        FileFilter::new("/etc/hosts", "", false, Monitor),
        FileFilter::new("/etc/passwd", "", false, Monitor),
        FileFilter::new("/etc/shadow", "", false, Monitor),
        FileFilter::new("/etc/resolv\\.conf", "", false, Monitor),
        FileFilter::new("/home/.*/\\.ssh", ".*", false, Monitor),
        FileFilter::new("/lib", "ld-linux\\..*", true, Monitor),
        FileFilter::new("/lib", "libc\\..*", true, Monitor),
        FileFilter::new("/lib", "libpthread.*", true, Monitor),
        FileFilter::new("/lib64", "ld-linux.*", true, Monitor),
        FileFilter::new("/lib64", "libc\\..*", true, Monitor),
        FileFilter::new("/lib64", "libpthread.*", true, Monitor),
        FileFilter::new("/bin", ".*", true, Monitor),
        FileFilter::new("/sbin", ".*", true, Monitor),
        FileFilter::new("/usr/bin", ".*", true, Monitor),
        FileFilter::new("/usr/sbin", ".*", true, Monitor),
        FileFilter::new("/usr/local/bin", ".*", true, Monitor),
        FileFilter::new("/usr/local/sbin", ".*", true, Monitor),
    ];

    MonitorProfile {
        group: String::new(),
        mode: None,
        filters,
        crd_filters: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_key_is_injective_over_path_and_regex() {
        let a = FileFilter::new("/etc/passwd", "", false, FilterBehavior::Monitor);
        let b = FileFilter::new("/etc/passwd", ".*", false, FilterBehavior::Monitor);
        let c = FileFilter::new("/bin", ".*", true, FilterBehavior::Monitor);
        assert_eq!(a.key(), "/etc/passwd/");
        assert_eq!(b.key(), "/etc/passwd/.*");
        assert_ne!(a.key(), b.key());
        assert_ne!(b.key(), c.key());
    }

    #[test]
    fn runtime_added_files() {
        assert!(is_runtime_added_file("/proc/42/root/etc/hosts"));
        assert!(is_runtime_added_file("/proc/1/root/etc/resolv.conf"));
        assert!(!is_runtime_added_file("/proc/42/root/etc/passwd"));
        assert!(!is_runtime_added_file("/proc/42/root/home/etc/hosts"));
    }

    #[test]
    fn package_paths() {
        assert!(is_package_path("/var/lib/dpkg/status"));
        assert!(is_package_path("/proc/7/root/lib/apk/db/installed"));
        assert!(!is_package_path("/etc/passwd"));
    }

    #[test]
    fn policy_mode_round_trip() {
        for mode in [PolicyMode::Learn, PolicyMode::Evaluate, PolicyMode::Enforce] {
            assert_eq!(mode.to_string().parse::<PolicyMode>().unwrap(), mode);
        }
        assert!("observe".parse::<PolicyMode>().is_err());
    }
}
