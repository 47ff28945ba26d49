//! Shared data model for the filegate agent.
//!
//! This crate holds the types exchanged between the agent shell and the
//! file monitor: watch profiles and their filters, the outbound report
//! and rule types, process identity, and the `/proc` parsing helpers
//! used to address files inside container mount namespaces.

pub mod config;
pub mod event;
pub mod process;
pub mod procfs;
pub mod profile;

pub use event::{FileEventKind, MonitorAction, MonitorMessage, MonitorProbe, WatchedFile};
pub use process::{ControlError, ControlPlane, ProcInfo, ProcessLookup};
pub use profile::{
    AccessRule, AccessRuleReq, AccessRuleSet, FileFilter, FilterBehavior, MonitorProfile,
    PolicyMode,
};
