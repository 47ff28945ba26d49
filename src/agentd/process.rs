//! Procfs-backed process lookup.

use filegate_core::process::{ProcInfo, ProcessLookup};
use filegate_core::procfs;

/// Resolves kernel-reported pids through `/proc`.
///
/// Lookups happen on the fanotify permission path, so every accessor
/// is a couple of small procfs reads and nothing more.
#[derive(Debug, Default)]
pub struct ProcfsLookup;

impl ProcessLookup for ProcfsLookup {
    fn process_info(&self, pid: i32) -> Option<ProcInfo> {
        let name = procfs::process_comm(pid).ok()?;
        let path = procfs::process_image(pid)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cmds = procfs::process_command_line(pid).unwrap_or_default();
        let euid = procfs::process_euid(pid).unwrap_or(0);
        let euser = procfs::user_name(euid).unwrap_or_default();
        let ppid = procfs::process_parent_pid(pid).unwrap_or(0);
        let (pname, ppath) = if ppid > 0 {
            (
                procfs::process_comm(ppid).unwrap_or_default(),
                procfs::process_image(ppid)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        } else {
            (String::new(), String::new())
        };
        let root_pid = procfs::container_root_pid(pid).unwrap_or(1);

        Some(ProcInfo {
            root_pid,
            name,
            path,
            cmds,
            pid,
            euid,
            euser,
            ppid,
            pname,
            ppath,
            deny: false,
            in_profile: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_the_current_process() {
        let pid = std::process::id() as i32;
        let info = ProcfsLookup.process_info(pid).unwrap();
        assert_eq!(info.pid, pid);
        assert!(!info.name.is_empty());
        assert!(info.ppid > 0);
        // The test process runs on the host side.
        assert_eq!(info.root_pid, 1);
    }

    #[test]
    fn unknown_pid_resolves_to_none() {
        assert!(ProcfsLookup.process_info(-1).is_none());
    }
}
