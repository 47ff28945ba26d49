//! Process identity and the callback seams of the monitor.

use serde::Serialize;

use crate::event::MonitorMessage;
use crate::profile::AccessRuleReq;

/// Identity of a process observed on a kernel event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcInfo {
    /// Host pid of the container init the process lives under, 1 for
    /// host processes.
    pub root_pid: i32,
    pub name: String,
    pub path: String,
    pub cmds: Vec<String>,
    pub pid: i32,
    pub euid: u32,
    pub euser: String,
    pub ppid: i32,
    pub pname: String,
    pub ppath: String,
    /// Set when the permission verdict for the access was deny.
    pub deny: bool,
    /// Set when the process matched an access rule of the profile.
    pub in_profile: bool,
}

/// Resolves a kernel-reported pid to a full process identity.
///
/// Implementations must be cheap and non-blocking; the fanotify
/// permission path calls this while the kernel is waiting on a verdict.
pub trait ProcessLookup: Send + Sync {
    fn process_info(&self, pid: i32) -> Option<ProcInfo>;
}

pub type ControlError = Box<dyn std::error::Error + Send + Sync>;

/// The controller-facing callbacks the monitor is constructed with.
///
/// All three may block; the monitor never calls them while holding its
/// internal lock, and never from the permission-decision path.
pub trait ControlPlane: Send + Sync {
    /// Transport one alert. Returns whether the message was accepted.
    fn send_report(&self, msg: MonitorMessage) -> bool;

    /// Upload a batch of learned access rules. Failed batches are
    /// dropped, not re-queued; the rules re-derive from future events.
    fn send_access_rules(&self, rules: Vec<AccessRuleReq>) -> Result<(), ControlError>;

    /// Name the group an alert should be attributed to when the monitor
    /// cannot determine it locally.
    fn estimate_rule_source(&self, id: &str, path: &str, denied: bool) -> String;
}
