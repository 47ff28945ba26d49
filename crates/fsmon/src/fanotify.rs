//! Fanotify driver.
//!
//! One fanotify group serves every monitored container. Each container
//! root carries a mode bundle deciding which events its marks request:
//! `access` adds open notifications, `perm` adds permission events, and
//! `cap_block` allows the driver to answer them with a deny.
//!
//! Permission events are answered synchronously from the reader thread.
//! The decision consults only the driver's own rule tables and fails
//! open: whenever a verdict cannot be computed the access is allowed.
//! Deny and violation records are forwarded to the aggregator; the
//! report callback is never invoked from this path.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::fanotify::{
    EventFFlags, Fanotify, FanotifyEvent, FanotifyResponse, InitFlags, MarkFlags, MaskFlags,
    Response,
};
use tokio::sync::mpsc::UnboundedSender;

use filegate_core::event::{FanotifyProbe, WatchedFile};
use filegate_core::process::{ProcInfo, ProcessLookup};
use filegate_core::procfs;
use filegate_core::profile::AccessRuleSet;

use crate::filter::parent_dir;
use crate::mask::EventMask;
use crate::{wait_event_fd, FileInfo, FsmonError, MonitorEvent, RawFileEvent};

struct DirWatch {
    info: Arc<FileInfo>,
    children: HashMap<String, Arc<FileInfo>>,
}

struct RootWatch {
    container_id: String,
    access: bool,
    perm: bool,
    cap_block: bool,
    is_agent: bool,
    started: bool,
    /// Single-file targets, keyed by container path.
    files: HashMap<String, Arc<FileInfo>>,
    /// Directory targets, keyed by container path.
    dirs: HashMap<String, DirWatch>,
    /// Allowed processes per filter key.
    rules: HashMap<String, HashSet<String>>,
}

impl RootWatch {
    fn new(container_id: &str) -> Self {
        RootWatch {
            container_id: container_id.to_string(),
            access: false,
            perm: false,
            cap_block: false,
            is_agent: false,
            started: false,
            files: HashMap::new(),
            dirs: HashMap::new(),
            rules: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct FanTables {
    roots: HashMap<i32, RootWatch>,
    /// Roots carrying a whole-mount permission mark.
    mount_roots: HashSet<i32>,
}

pub(crate) struct FanotifyDriver {
    fan: Fanotify,
    /// False when the kernel cannot deliver permission events; every
    /// group then runs notify-only regardless of its profile.
    perm_supported: bool,
    agent_pid: i32,
    nv_protect: AtomicBool,
    lookup: Arc<dyn ProcessLookup>,
    tx: UnboundedSender<MonitorEvent>,
    tables: Mutex<FanTables>,
}

/// A matched watch target for one kernel event.
struct Matched {
    root_pid: i32,
    /// Host-side path the aggregator keys on.
    host_path: PathBuf,
    info: Arc<FileInfo>,
    filter_key: String,
    protect: bool,
}

impl FanotifyDriver {
    pub(crate) fn new(
        lookup: Arc<dyn ProcessLookup>,
        tx: UnboundedSender<MonitorEvent>,
        nv_protect: bool,
        end: Arc<OwnedFd>,
    ) -> Result<Arc<FanotifyDriver>, FsmonError> {
        let event_fflags = EventFFlags::O_RDONLY | EventFFlags::O_LARGEFILE | EventFFlags::O_CLOEXEC;
        let content = InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK | InitFlags::FAN_CLASS_CONTENT;
        let (fan, perm_supported) = match Fanotify::init(content, event_fflags) {
            Ok(fan) => (fan, true),
            Err(Errno::EINVAL) | Err(Errno::ENOSYS) => {
                log::warn!("fanotify permission events unsupported, running notify-only");
                let notif =
                    InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK | InitFlags::FAN_CLASS_NOTIF;
                (
                    Fanotify::init(notif, event_fflags).map_err(FsmonError::FanotifyInit)?,
                    false,
                )
            }
            Err(e) => return Err(FsmonError::FanotifyInit(e)),
        };

        let driver = Arc::new(FanotifyDriver {
            fan,
            perm_supported,
            agent_pid: std::process::id() as i32,
            nv_protect: AtomicBool::new(nv_protect),
            lookup,
            tx,
            tables: Mutex::new(FanTables::default()),
        });

        let reader = driver.clone();
        std::thread::Builder::new()
            .name("fsmon-fanotify".to_string())
            .spawn(move || reader.read_loop(end))
            .map_err(|e| FsmonError::FanotifyInit(Errno::from_raw(e.raw_os_error().unwrap_or(0))))?;

        Ok(driver)
    }

    pub(crate) fn set_nv_protect(&self, enabled: bool) {
        self.nv_protect.store(enabled, Ordering::Relaxed);
    }

    /// Set the mode bundle of a container root. Creates the root entry
    /// when this is the first call for the pid.
    pub(crate) fn set_mode(
        &self,
        root_pid: i32,
        access: bool,
        perm: bool,
        cap_block: bool,
        is_agent: bool,
        container_id: &str,
    ) {
        let mut tables = self.tables.lock().unwrap();
        let root = tables
            .roots
            .entry(root_pid)
            .or_insert_with(|| RootWatch::new(container_id));
        root.container_id = container_id.to_string();
        root.access = access;
        root.perm = perm && self.perm_supported;
        root.cap_block = cap_block;
        root.is_agent = is_agent;
    }

    pub(crate) fn add_monitor_file(&self, info: Arc<FileInfo>) -> bool {
        let Some((root_pid, cpath)) = procfs::parse_container_file_path(&info.path) else {
            return false;
        };
        let mut tables = self.tables.lock().unwrap();
        let root = tables
            .roots
            .entry(root_pid)
            .or_insert_with(|| RootWatch::new(&info.container_id));
        let marked = if root.started {
            self.mark_target(root, &info, false)
        } else {
            true
        };
        root.files.insert(cpath, info);
        marked
    }

    pub(crate) fn add_monitor_dir_file(
        &self,
        info: Arc<FileInfo>,
        children: HashMap<String, Arc<FileInfo>>,
    ) -> bool {
        let Some((root_pid, cpath)) = procfs::parse_container_file_path(&info.path) else {
            return false;
        };
        let mut tables = self.tables.lock().unwrap();
        let root = tables
            .roots
            .entry(root_pid)
            .or_insert_with(|| RootWatch::new(&info.container_id));
        let marked = if root.started {
            self.mark_target(root, &info, true)
        } else {
            true
        };
        match root.dirs.get_mut(&cpath) {
            Some(dir) => dir.children.extend(children),
            None => {
                root.dirs.insert(cpath, DirWatch { info, children });
            }
        }
        marked
    }

    pub(crate) fn remove_monitor_file(&self, path: &Path) {
        let Some((root_pid, cpath)) = procfs::parse_container_file_path(path) else {
            return;
        };
        let mut tables = self.tables.lock().unwrap();
        let Some(root) = tables.roots.get_mut(&root_pid) else {
            return;
        };
        let removed = if let Some(info) = root.files.remove(&cpath) {
            Some((info, false))
        } else {
            root.dirs.remove(&cpath).map(|d| (d.info, true))
        };
        if let Some((info, is_dir)) = removed {
            if root.started {
                self.unmark_target(root, &info, is_dir);
            }
        } else if let Some(dir) = root.dirs.get_mut(&parent_dir(&cpath)) {
            // A child of a watched directory has no mark of its own.
            if let Some(name) = Path::new(&cpath).file_name() {
                dir.children.remove(&name.to_string_lossy().into_owned());
            }
        }
    }

    /// Arm the marks of a prepared root and start serving its events.
    pub(crate) fn start_monitor(&self, root_pid: i32) {
        let mut tables = self.tables.lock().unwrap();
        let add_mount = {
            let Some(root) = tables.roots.get_mut(&root_pid) else {
                return;
            };
            root.started = true;
            let file_infos: Vec<Arc<FileInfo>> = root.files.values().cloned().collect();
            for info in file_infos {
                self.mark_target(root, &info, false);
            }
            let dir_infos: Vec<Arc<FileInfo>> = root.dirs.values().map(|d| d.info.clone()).collect();
            for info in dir_infos {
                self.mark_target(root, &info, true);
            }
            root.perm
        };
        if add_mount && !tables.mount_roots.contains(&root_pid) {
            let mount = format!("/proc/{root_pid}/root");
            match self.fan.mark(
                MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_MOUNT,
                MaskFlags::FAN_OPEN_PERM | MaskFlags::FAN_ACCESS_PERM,
                None,
                Some(Path::new(&mount)),
            ) {
                Ok(()) => {
                    tables.mount_roots.insert(root_pid);
                }
                Err(e) => log::warn!("mount mark for pid {root_pid} failed: {e}"),
            }
        }
    }

    /// Replace the allowed-process table of a root.
    pub(crate) fn update_access_rule(&self, root_pid: i32, rule: &AccessRuleSet) {
        let mut tables = self.tables.lock().unwrap();
        let Some(root) = tables.roots.get_mut(&root_pid) else {
            log::debug!("no fanotify root for pid {root_pid}");
            return;
        };
        root.rules.clear();
        for (key, entry) in &rule.filters {
            if entry.user_added {
                root.rules
                    .insert(key.clone(), entry.apps.iter().cloned().collect());
            }
        }
    }

    pub(crate) fn container_cleanup(&self, root_pid: i32) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(root) = tables.roots.remove(&root_pid) {
            if root.started {
                for info in root.files.values() {
                    self.unmark_target(&root, info, false);
                }
                for dir in root.dirs.values() {
                    self.unmark_target(&root, &dir.info, true);
                }
            }
        }
        if tables.mount_roots.remove(&root_pid) {
            let mount = format!("/proc/{root_pid}/root");
            let _ = self.fan.mark(
                MarkFlags::FAN_MARK_REMOVE | MarkFlags::FAN_MARK_MOUNT,
                MaskFlags::FAN_OPEN_PERM | MaskFlags::FAN_ACCESS_PERM,
                None,
                Some(Path::new(&mount)),
            );
        }
    }

    pub(crate) fn has_target(&self, path: &Path) -> bool {
        let Some((root_pid, cpath)) = procfs::parse_container_file_path(path) else {
            return false;
        };
        let tables = self.tables.lock().unwrap();
        let Some(root) = tables.roots.get(&root_pid) else {
            return false;
        };
        if root.files.contains_key(&cpath) || root.dirs.contains_key(&cpath) {
            return true;
        }
        match (root.dirs.get(&parent_dir(&cpath)), Path::new(&cpath).file_name()) {
            (Some(dir), Some(name)) => dir.children.contains_key(name.to_string_lossy().as_ref()),
            _ => false,
        }
    }

    pub(crate) fn get_watch_file_list(&self, root_pid: i32) -> Vec<WatchedFile> {
        let tables = self.tables.lock().unwrap();
        tables
            .roots
            .get(&root_pid)
            .map(list_root)
            .unwrap_or_default()
    }

    pub(crate) fn get_watches(&self) -> Vec<WatchedFile> {
        let tables = self.tables.lock().unwrap();
        tables.roots.values().flat_map(list_root).collect()
    }

    pub(crate) fn probe_data(&self) -> FanotifyProbe {
        let tables = self.tables.lock().unwrap();
        let mut probe = FanotifyProbe {
            roots: tables.roots.len(),
            mount_roots: tables.mount_roots.len(),
            ..Default::default()
        };
        for root in tables.roots.values() {
            probe.paths += root.files.len();
            probe.dirs += root.dirs.len();
            if root.started {
                probe.dir_marks += root.dirs.len();
            }
            probe.rules += root.rules.values().map(HashSet::len).sum::<usize>();
        }
        probe
    }

    fn mark_mask(root: &RootWatch, protect: bool, is_dir: bool) -> MaskFlags {
        let mut mask = MaskFlags::FAN_CLOSE_WRITE | MaskFlags::FAN_MODIFY;
        if root.access {
            mask |= MaskFlags::FAN_OPEN;
        }
        if root.perm && protect {
            mask |= MaskFlags::FAN_OPEN_PERM | MaskFlags::FAN_ACCESS_PERM;
        }
        if is_dir {
            mask |= MaskFlags::FAN_EVENT_ON_CHILD | MaskFlags::FAN_ONDIR;
        }
        mask
    }

    fn mark_target(&self, root: &RootWatch, info: &FileInfo, is_dir: bool) -> bool {
        let mask = Self::mark_mask(root, info.protect, is_dir);
        match self
            .fan
            .mark(MarkFlags::FAN_MARK_ADD, mask, None, Some(info.path.as_path()))
        {
            Ok(()) => true,
            // The target vanished between enumeration and arming.
            Err(Errno::ENOENT) => false,
            Err(e @ (Errno::ENOMEM | Errno::ENOSPC)) => {
                log::warn!("out of mark resources for {}: {e}", info.path.display());
                false
            }
            Err(e) => {
                log::warn!("fanotify mark for {} failed: {e}", info.path.display());
                false
            }
        }
    }

    fn unmark_target(&self, root: &RootWatch, info: &FileInfo, is_dir: bool) {
        let mask = Self::mark_mask(root, info.protect, is_dir);
        if let Err(e) = self
            .fan
            .mark(MarkFlags::FAN_MARK_REMOVE, mask, None, Some(info.path.as_path()))
        {
            // Gone targets and dead mounts unmark themselves.
            if e != Errno::ENOENT && e != Errno::EINVAL && e != Errno::EBADF {
                log::debug!("fanotify unmark for {} failed: {e}", info.path.display());
            }
        }
    }

    fn read_loop(&self, end: Arc<OwnedFd>) {
        while wait_event_fd(self.fan.as_fd().as_raw_fd(), &end) {
            loop {
                match self.fan.read_events() {
                    Ok(events) => {
                        if events.is_empty() {
                            break;
                        }
                        for event in events {
                            self.handle_event(&event);
                        }
                    }
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    // The descriptor went away underneath us: shutdown.
                    Err(Errno::EBADF) => return,
                    Err(e) => {
                        log::warn!("fanotify read failed: {e}");
                        return;
                    }
                }
            }
        }
        log::debug!("fanotify reader exits");
    }

    fn handle_event(&self, event: &FanotifyEvent) {
        let mask = EventMask::from_fanotify_bits(event.mask().bits());
        if mask.contains(EventMask::Q_OVERFLOW) {
            log::warn!("fanotify event queue overflowed");
            return;
        }
        let Some(fd) = event.fd() else { return };
        let pid = event.pid();

        let link = fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok();

        if mask.intersects(EventMask::PERM) {
            let response = if pid == self.agent_pid {
                Response::FAN_ALLOW
            } else {
                let process = self.lookup.process_info(pid);
                let (response, record) = self.decide(link.as_deref(), process);
                if let Some(record) = record {
                    let _ = self.tx.send(record);
                }
                response
            };
            if let Err(e) = self.fan.write_response(FanotifyResponse::new(fd, response)) {
                log::warn!("fanotify response failed: {e}");
            }
            return;
        }

        // The monitor's own reads (hashing, stat) would feed back here.
        if pid == self.agent_pid {
            return;
        }
        let process = self.lookup.process_info(pid);
        if let Some(record) = self.resolve_notify(link.as_deref(), mask, process) {
            let _ = self.tx.send(record);
        }
    }

    /// Answer one permission event. Fail-open: any miss along the way
    /// allows the access.
    fn decide(
        &self,
        link: Option<&Path>,
        process: Option<ProcInfo>,
    ) -> (Response, Option<MonitorEvent>) {
        let Some(mut process) = process else {
            return (Response::FAN_ALLOW, None);
        };
        let Some(link) = link else {
            return (Response::FAN_ALLOW, None);
        };

        let tables = self.tables.lock().unwrap();
        let Some(root) = tables.roots.get(&process.root_pid) else {
            return (Response::FAN_ALLOW, None);
        };
        if !root.started || !root.perm {
            return (Response::FAN_ALLOW, None);
        }
        let Some(matched) = match_target(process.root_pid, root, link) else {
            return (Response::FAN_ALLOW, None);
        };
        if !matched.protect {
            return (Response::FAN_ALLOW, None);
        }

        let allowed = root.rules.get(&matched.filter_key).is_some_and(|set| {
            set.contains(&process.path) || set.contains(&process.name) || set.contains(&process.ppath)
        });
        let cap_block = root.cap_block;
        drop(tables);

        if allowed {
            return (Response::FAN_ALLOW, None);
        }

        process.deny = cap_block;
        let record = MonitorEvent::File(RawFileEvent {
            path: matched.host_path,
            mask: EventMask::OPEN | EventMask::ACCESS,
            info: matched.info,
            process: Some(process),
        });
        if cap_block {
            (Response::FAN_DENY, Some(record))
        } else {
            // Without the capability to block, record a violation.
            (Response::FAN_ALLOW, Some(record))
        }
    }

    fn resolve_notify(
        &self,
        link: Option<&Path>,
        mut mask: EventMask,
        process: Option<ProcInfo>,
    ) -> Option<MonitorEvent> {
        let link = link?;
        // The aggregator speaks the inotify dialect, where an open
        // notification is an access.
        if mask.contains(EventMask::OPEN) {
            mask |= EventMask::ACCESS;
        }
        let tables = self.tables.lock().unwrap();

        // Prefer the root of the acting process, fall back to scanning.
        let matched = match process.as_ref().map(|p| p.root_pid) {
            Some(root_pid) => tables
                .roots
                .get(&root_pid)
                .and_then(|root| match_target(root_pid, root, link)),
            None => None,
        }
        .or_else(|| {
            tables
                .roots
                .iter()
                .find_map(|(pid, root)| match_target(*pid, root, link))
        })?;

        let root = tables.roots.get(&matched.root_pid)?;
        if root.is_agent {
            if self.nv_protect.load(Ordering::Relaxed)
                && mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE)
            {
                if let Some(process) = process {
                    if process.root_pid != matched.root_pid {
                        return Some(MonitorEvent::AgentAlert {
                            root_pid: matched.root_pid,
                            id: root.container_id.clone(),
                            path: matched.host_path.to_string_lossy().into_owned(),
                            process,
                        });
                    }
                }
            }
            return None;
        }

        Some(MonitorEvent::File(RawFileEvent {
            path: matched.host_path,
            mask,
            info: matched.info,
            process,
        }))
    }
}

/// Locate the watch target an event's backing path belongs to. The
/// kernel reports the host-side backing path (an overlay path for
/// containers); targets are matched by container-path suffix.
fn match_target(root_pid: i32, root: &RootWatch, link: &Path) -> Option<Matched> {
    let lp = link.to_string_lossy();

    for (cpath, info) in &root.files {
        if path_suffix_match(&lp, cpath) {
            return Some(Matched {
                root_pid,
                host_path: procfs::container_file_path(root_pid, cpath),
                info: info.clone(),
                filter_key: info.filter.key.clone(),
                protect: info.protect,
            });
        }
    }

    let parent = parent_dir(&lp);
    for (dkey, dir) in &root.dirs {
        if path_suffix_match(&lp, dkey) {
            return Some(Matched {
                root_pid,
                host_path: procfs::container_file_path(root_pid, dkey),
                info: dir.info.clone(),
                filter_key: dir.info.filter.key.clone(),
                protect: dir.info.protect,
            });
        }
        if path_suffix_match(&parent, dkey) {
            let name = link.file_name()?.to_string_lossy();
            let host_path =
                procfs::container_file_path(root_pid, &format!("{dkey}/{name}"));
            let info = dir
                .children
                .get(name.as_ref())
                .unwrap_or(&dir.info)
                .clone();
            return Some(Matched {
                root_pid,
                host_path,
                filter_key: dir.info.filter.key.clone(),
                protect: dir.info.protect,
                info,
            });
        }
    }

    None
}

/// Suffix match on a path boundary: `suffix` always starts with `/`.
fn path_suffix_match(path: &str, suffix: &str) -> bool {
    path == suffix || path.ends_with(suffix)
}

fn list_root(root: &RootWatch) -> Vec<WatchedFile> {
    let mut list: Vec<WatchedFile> = root
        .files
        .iter()
        .map(|(cpath, info)| WatchedFile {
            path: cpath.clone(),
            is_dir: false,
            protect: info.protect,
            files: Vec::new(),
        })
        .collect();
    list.extend(root.dirs.iter().map(|(cpath, dir)| WatchedFile {
        path: cpath.clone(),
        is_dir: true,
        protect: dir.info.protect,
        files: dir.children.keys().cloned().collect(),
    }));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_match_respects_path_boundaries() {
        assert!(path_suffix_match(
            "/var/lib/docker/overlay2/abc/merged/etc/passwd",
            "/etc/passwd"
        ));
        assert!(path_suffix_match("/etc/passwd", "/etc/passwd"));
        assert!(!path_suffix_match("/etc/passwd-", "/etc/passwd"));
        assert!(!path_suffix_match("/betc/passwd", "/etc/passwd"));
    }
}
