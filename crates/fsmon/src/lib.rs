//! Container file-integrity and access-control monitor.
//!
//! For every monitored container the crate derives concrete watch
//! targets from a declarative profile, arms two kernel notification
//! channels (fanotify for permission-capable marks, inotify for inode
//! events), coalesces the raw events per path over a short window,
//! classifies them against the post-event filesystem state, and emits
//! typed monitor messages through the report callback.
//!
//! In `Learn` mode observed accesses build per-filter process rules
//! that are periodically shipped to the controller; in `Enforce` mode
//! the fanotify driver answers permission events with a deny when the
//! acting process is not in the rule set.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # fn wire(lookup: Arc<dyn filegate_core::ProcessLookup>,
//! #         control: Arc<dyn filegate_core::ControlPlane>) -> Result<(), fsmon::FsmonError> {
//! use fsmon::{FileMonitor, LocalPathWalker, MonitorConfig};
//!
//! let monitor = FileMonitor::new(MonitorConfig {
//!     profile_enable: true,
//!     is_aufs: false,
//!     enable_trace: false,
//!     nv_protect: false,
//!     walker: Arc::new(LocalPathWalker),
//!     lookup,
//!     control,
//! })?;
//! # Ok(()) }
//! ```

mod fanotify;
pub mod filter;
pub mod hash;
mod inotify;
pub mod mask;
pub mod walker;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;

use filegate_core::event::{FileEventKind, MonitorMessage, MonitorProbe, WatchedFile};
use filegate_core::process::{ControlPlane, ProcInfo, ProcessLookup};
use filegate_core::procfs;
use filegate_core::profile::{
    is_package_path, is_runtime_added_file, AccessRuleReq, AccessRuleSet, FileFilter,
    MonitorProfile, PolicyMode,
};

use crate::fanotify::FanotifyDriver;
use crate::filter::{parent_dir, CompiledFilter, TargetDir, TargetFile};
use crate::hash::{ContentHash, FileIdent};
use crate::inotify::InotifyDriver;
use crate::mask::EventMask;
use crate::walker::{PathWalker, WalkerClient};

pub use crate::walker::{LocalPathWalker, WalkRequest, WalkResult, WalkerError};

/// How long events accumulate per path before classification.
const AGGREGATE_INTERVAL: Duration = Duration::from_secs(4);
/// How often learned rules are shipped to the controller.
const LEARN_INTERVAL: Duration = Duration::from_secs(10);
/// Events on runtime-added files are suppressed while the container is
/// younger than this.
const RUNTIME_FILE_GRACE: Duration = Duration::from_secs(60);

const AGENT_PROTECT_ALERT: &str = "Agent protection: process alert.";

#[derive(Error, Debug)]
pub enum FsmonError {
    #[error("opening the fanotify channel failed: {0}")]
    FanotifyInit(#[source] Errno),
    #[error("opening the inotify channel failed: {0}")]
    InotifyInit(#[source] std::io::Error),
    #[error("creating the shutdown channel failed: {0}")]
    EndChannel(#[source] Errno),
}

/// Block until either fd is readable. Returns false once the end
/// channel fires, telling the reader to exit.
pub(crate) fn wait_event_fd(fd: RawFd, end: &OwnedFd) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    loop {
        // The raw fd is owned by the driver and outlives its reader.
        let event_fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [
            PollFd::new(event_fd, PollFlags::POLLIN),
            PollFd::new(end.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {
                let fired = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                if fds[1].revents().is_some_and(|r| r.intersects(fired)) {
                    return false;
                }
                if fds[0].revents().is_some_and(|r| r.intersects(fired)) {
                    return true;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("poll on notification fd failed: {e}");
                return false;
            }
        }
    }
}

#[derive(Debug, Default)]
struct FileState {
    ident: FileIdent,
    hash: ContentHash,
}

/// A resolved watch target shared between the drivers and the
/// aggregator. The content-hash state is interior so that every event
/// referring to the target sees the latest computed hash.
#[derive(Debug)]
pub struct FileInfo {
    pub container_id: String,
    /// Host-side path, `/proc/<pid>/root/<container path>`.
    pub path: PathBuf,
    pub is_dir: bool,
    pub protect: bool,
    pub user_added: bool,
    /// Resolved symlink target, empty for regular targets.
    pub link: String,
    pub filter: Arc<CompiledFilter>,
    state: Mutex<FileState>,
}

impl FileInfo {
    #[allow(clippy::too_many_arguments)]
    fn new(
        container_id: &str,
        path: PathBuf,
        is_dir: bool,
        protect: bool,
        user_added: bool,
        link: String,
        filter: Arc<CompiledFilter>,
    ) -> FileInfo {
        FileInfo {
            container_id: container_id.to_string(),
            path,
            is_dir,
            protect,
            user_added,
            link,
            filter,
            state: Mutex::new(FileState::default()),
        }
    }

    fn from_target_file(container_id: &str, target: &TargetFile) -> FileInfo {
        FileInfo::new(
            container_id,
            target.path.clone(),
            false,
            target.protect,
            target.user_added,
            String::new(),
            target.filter.clone(),
        )
    }

    fn from_target_dir(container_id: &str, target: &TargetDir) -> FileInfo {
        FileInfo::new(
            container_id,
            target.path.clone(),
            true,
            target.protect,
            target.user_added,
            String::new(),
            target.filter.clone(),
        )
    }

    /// Stat a path discovered at runtime and build its watch target.
    /// Symlinks resolve their target inside the container root of
    /// `pid`. Returns `None` when the path vanished again.
    fn from_path(
        container_id: &str,
        path: &Path,
        pid: i32,
        filter: Arc<CompiledFilter>,
        protect: bool,
        user_added: bool,
    ) -> Option<FileInfo> {
        let meta = fs::symlink_metadata(path).ok()?;
        let mut is_dir = meta.is_dir();
        let mut link = String::new();
        if meta.file_type().is_symlink() {
            if let Ok(target) = fs::read_link(path) {
                let resolved = if target.is_absolute() {
                    PathBuf::from(format!("/proc/{pid}/root{}", target.display()))
                } else {
                    path.parent()
                        .map(|dir| dir.join(&target))
                        .unwrap_or(target)
                };
                if let Ok(target_meta) = fs::metadata(&resolved) {
                    is_dir = target_meta.is_dir();
                }
                link = resolved.to_string_lossy().into_owned();
            }
        }
        Some(FileInfo::new(
            container_id,
            path.to_path_buf(),
            is_dir,
            protect,
            user_added,
            link,
            filter,
        ))
    }

    /// Content hash with the `(inode, size)` pre-filter: unchanged
    /// identity reuses the stored hash without reading the file. Only
    /// regular files are hashed; opening anything else could stall the
    /// flush.
    fn content_hash(&self, path: &Path) -> std::io::Result<ContentHash> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::ErrorKind::InvalidInput.into());
        }
        let ident = hash::ident_of(&meta);
        {
            let state = self.state.lock().unwrap();
            if state.ident == ident && !hash::is_zero(&state.hash) {
                return Ok(state.hash);
            }
        }
        let computed = hash::hash_file(path)?;
        self.state.lock().unwrap().ident = ident;
        Ok(computed)
    }

    fn stored_hash(&self) -> ContentHash {
        self.state.lock().unwrap().hash
    }

    fn store_hash(&self, hash: ContentHash) {
        self.state.lock().unwrap().hash = hash;
    }
}

/// One raw kernel event as handed over by a driver.
pub(crate) struct RawFileEvent {
    pub path: PathBuf,
    pub mask: EventMask,
    pub info: Arc<FileInfo>,
    pub process: Option<ProcInfo>,
}

pub(crate) enum MonitorEvent {
    File(RawFileEvent),
    /// A foreign process touched the agent's own files.
    AgentAlert {
        root_pid: i32,
        id: String,
        path: String,
        process: ProcInfo,
    },
}

/// Aggregated pending event for one path.
struct FileMod {
    mask: EventMask,
    info: Arc<FileInfo>,
    procs: Vec<ProcInfo>,
}

/// Monitoring state of one container, keyed by its root pid.
struct GroupInfo {
    is_agent: bool,
    profile: MonitorProfile,
    mode: PolicyMode,
    apply_rules: HashMap<String, HashSet<String>>,
    learn_rules: HashMap<String, HashSet<String>>,
    start_at: Instant,
}

#[derive(Default)]
struct MonitorState {
    file_events: HashMap<PathBuf, FileMod>,
    groups: HashMap<i32, GroupInfo>,
}

/// Profile and rules a container is watched with.
#[derive(Debug, Clone, Default)]
pub struct WatchConfig {
    pub profile: MonitorProfile,
    pub rule: Option<AccessRuleSet>,
}

/// Construction parameters of the monitor.
pub struct MonitorConfig {
    /// False renders the monitor inert: every operation is a no-op.
    pub profile_enable: bool,
    /// Permission enforcement is unreliable on AUFS and disabled for
    /// every group when this is set.
    pub is_aufs: bool,
    pub enable_trace: bool,
    /// Alert on foreign writes to the agent's own files.
    pub nv_protect: bool,
    pub walker: Arc<dyn PathWalker>,
    pub lookup: Arc<dyn ProcessLookup>,
    pub control: Arc<dyn ControlPlane>,
}

pub struct FileMonitor {
    enabled: bool,
    aufs: bool,
    trace: AtomicBool,
    nv_protect: AtomicBool,
    fan: Option<Arc<FanotifyDriver>>,
    ino: Option<Arc<InotifyDriver>>,
    state: Mutex<MonitorState>,
    control: Arc<dyn ControlPlane>,
    walker: WalkerClient,
    end_channel: Mutex<Option<OwnedFd>>,
    shutdown_tx: watch::Sender<bool>,
}

impl FileMonitor {
    /// Open both notification channels and start the monitor workers.
    /// Must be called within a tokio runtime. Fails when neither
    /// kernel channel can be opened.
    pub fn new(config: MonitorConfig) -> Result<Arc<FileMonitor>, FsmonError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();

        let (fan, ino, end_channel) = if config.profile_enable {
            let (end_r, end_w) = nix::unistd::pipe().map_err(FsmonError::EndChannel)?;
            let end_r = Arc::new(end_r);
            let fan = FanotifyDriver::new(
                config.lookup.clone(),
                tx.clone(),
                config.nv_protect,
                end_r.clone(),
            )?;
            let ino = InotifyDriver::new(tx.clone(), end_r)?;
            (Some(fan), Some(ino), Some(end_w))
        } else {
            log::info!("file monitor is disabled");
            (None, None, None)
        };

        let monitor = Arc::new(FileMonitor {
            enabled: config.profile_enable,
            aufs: config.is_aufs,
            trace: AtomicBool::new(config.enable_trace),
            nv_protect: AtomicBool::new(config.nv_protect),
            fan,
            ino,
            state: Mutex::new(MonitorState::default()),
            control: config.control,
            walker: WalkerClient::new(config.walker),
            end_channel: Mutex::new(end_channel),
            shutdown_tx,
        });

        if monitor.enabled {
            tokio::spawn(monitor.clone().run(rx, shutdown_rx));
        }
        Ok(monitor)
    }

    async fn run(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<MonitorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut flush = tokio::time::interval(AGGREGATE_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut learn = tokio::time::interval(LEARN_INTERVAL);
        learn.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(MonitorEvent::File(event)) => self.on_raw_event(event),
                    Some(MonitorEvent::AgentAlert { root_pid, id, path, process }) => {
                        self.send_agent_process_alert(root_pid, &id, &path, &process);
                    }
                    None => break,
                },
                _ = flush.tick() => self.handle_watched_files(),
                _ = learn.tick() => self.report_learning_rules(),
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("file monitor loop exits");
    }

    /// Merge one raw driver event into the pending map. Watches the
    /// kernel released on its own arrive as IGNORED or UNMOUNT and
    /// only tear the path down.
    fn on_raw_event(&self, event: RawFileEvent) {
        if event
            .mask
            .intersects(EventMask::IGNORED | EventMask::UNMOUNT)
        {
            self.remove_file(&event.path);
            return;
        }

        let mut state = self.state.lock().unwrap();
        match state.file_events.get_mut(&event.path) {
            Some(pending) => {
                pending.mask |= event.mask;
                if let Some(process) = event.process {
                    if !pending.procs.iter().any(|p| p.pid == process.pid) {
                        pending.procs.push(process);
                    }
                }
            }
            None => {
                let procs = event.process.into_iter().collect();
                state.file_events.insert(
                    event.path,
                    FileMod {
                        mask: event.mask,
                        info: event.info,
                        procs,
                    },
                );
            }
        }
    }

    /// Swap out the pending map and classify every entry against the
    /// current filesystem state.
    fn handle_watched_files(&self) {
        let events = std::mem::take(&mut self.state.lock().unwrap().file_events);

        for (full_path, fmod) in events {
            let Some((pid, cpath)) = procfs::parse_container_file_path(&full_path) else {
                continue;
            };
            // Stale events of departed containers carry no signal; the
            // runtime rewrites /etc/hosts and friends on the way out.
            if !procfs::is_pid_alive(pid) {
                continue;
            }

            let meta = fs::symlink_metadata(&full_path).ok();
            let kind = if fmod.info.is_dir || meta.as_ref().is_some_and(|m| m.is_dir()) {
                self.handle_dir_events(&fmod, meta.as_ref(), &full_path, &cpath, pid)
            } else {
                self.handle_file_events(&fmod, meta.as_ref(), &full_path)
            };

            if let Some(kind) = kind {
                self.learn_from_events(pid, &fmod, &cpath, kind);
            }
        }
    }

    /// Decide the directory event, highest precedence first, arming
    /// newly appeared children along the way.
    fn handle_dir_events(
        &self,
        fmod: &FileMod,
        meta: Option<&fs::Metadata>,
        full_path: &Path,
        cpath: &str,
        pid: i32,
    ) -> Option<FileEventKind> {
        let info = &fmod.info;
        let Some(meta) = meta else {
            // The path is gone. The watched directory itself vanishing
            // outranks anything that happened to its children.
            if full_path == info.path {
                return Some(FileEventKind::DirRemoved);
            }
            let kind = if fmod.mask.intersects(EventMask::INODE_MOVED) {
                if fmod.mask.contains(EventMask::ISDIR) {
                    FileEventKind::DirMovedFrom
                } else {
                    FileEventKind::FileMovedFrom
                }
            } else {
                if fmod.mask.contains(EventMask::CREATE) && !self.is_armed(full_path) {
                    // Created and deleted within one window, never armed.
                    return None;
                }
                FileEventKind::FileRemoved
            };
            self.remove_file(full_path);
            return Some(kind);
        };

        let is_dir = meta.is_dir();
        if fmod
            .mask
            .intersects(EventMask::MOVED_TO | EventMask::CREATE)
        {
            if fmod.mask.intersects(EventMask::MOVED_TO) {
                let kind = if is_dir {
                    FileEventKind::DirMovedTo
                } else {
                    FileEventKind::FileMovedTo
                };
                self.arm_appeared_path(fmod, full_path, pid, is_dir);
                return Some(kind);
            }

            if is_dir {
                if !info.filter.recursive {
                    log::info!(
                        "directory {} created under a non-recursive watch",
                        full_path.display()
                    );
                    return Some(FileEventKind::DirCreated);
                }
                self.arm_appeared_path(fmod, full_path, pid, true);
                return Some(FileEventKind::DirCreated);
            }

            if meta.file_type().is_symlink() {
                let mut kind = FileEventKind::FileSymCreated;
                if let Ok(target) = fs::read_link(full_path) {
                    let resolved = if target.is_absolute() {
                        PathBuf::from(format!("/proc/{pid}/root{}", target.display()))
                    } else {
                        full_path
                            .parent()
                            .map(|dir| dir.join(&target))
                            .unwrap_or(target)
                    };
                    if fs::metadata(&resolved).map(|m| m.is_dir()).unwrap_or(false) {
                        kind = FileEventKind::DirSymCreated;
                    }
                }
                self.arm_appeared_path(fmod, full_path, pid, false);
                return Some(kind);
            }

            // A regular file appeared in the watched directory.
            if let Some(child) = FileInfo::from_path(
                &info.container_id,
                full_path,
                pid,
                info.filter.clone(),
                info.protect,
                info.user_added,
            ) {
                self.add_file(false, Arc::new(child));
            }
            return Some(FileEventKind::FileCreated);
        }

        if fmod.mask.contains(EventMask::ATTRIB) {
            return Some(if is_dir {
                FileEventKind::DirAttr
            } else {
                FileEventKind::FileAttr
            });
        }

        if fmod
            .mask
            .intersects(EventMask::ACCESS | EventMask::CLOSE_WRITE | EventMask::MODIFY)
        {
            let mut kind = FileEventKind::FileAccessed;
            if !is_dir {
                match info.content_hash(full_path) {
                    Ok(current) => {
                        let stored = info.stored_hash();
                        if current != stored {
                            if !hash::is_zero(&stored) {
                                kind = FileEventKind::FileModified;
                            }
                            info.store_hash(current);
                        }
                    }
                    Err(_) => {
                        if fmod.mask.contains(EventMask::MODIFY) {
                            kind = FileEventKind::FileModified;
                        }
                    }
                }
                if kind == FileEventKind::FileModified && !info.link.is_empty() {
                    kind = FileEventKind::FileSymModified;
                }
            } else if !info.link.is_empty() {
                kind = FileEventKind::DirSymModified;
            }
            return Some(kind);
        }

        log::debug!(
            "unclassified directory event at {} mask {:?}",
            full_path.display(),
            fmod.mask
        );
        None
    }

    /// Decide the file event, highest precedence first.
    fn handle_file_events(
        &self,
        fmod: &FileMod,
        meta: Option<&fs::Metadata>,
        full_path: &Path,
    ) -> Option<FileEventKind> {
        let info = &fmod.info;
        if meta.is_none() {
            if fmod.mask.intersects(EventMask::INODE_MOVED) {
                return Some(FileEventKind::FileMovedFrom);
            }
            self.remove_file(full_path);
            return Some(FileEventKind::FileRemoved);
        }

        if fmod.mask.intersects(EventMask::INODE_MOVED) {
            // The path is populated again; a different inode means the
            // file was replaced wholesale.
            let mut kind = FileEventKind::FileMovedTo;
            if let Ok(ident) = hash::file_ident(full_path) {
                let mut state = info.state.lock().unwrap();
                if state.ident.ino != 0 && state.ident.ino != ident.ino {
                    kind = FileEventKind::FileReplaced;
                }
                state.ident = ident;
            }
            self.add_file(true, info.clone());
            return Some(kind);
        }

        if fmod.mask.contains(EventMask::ATTRIB) {
            return Some(FileEventKind::FileAttr);
        }

        if fmod
            .mask
            .intersects(EventMask::ACCESS | EventMask::CLOSE_WRITE | EventMask::MODIFY)
        {
            let mut kind = FileEventKind::FileAccessed;
            match info.content_hash(full_path) {
                Ok(current) => {
                    let stored = info.stored_hash();
                    if current != stored {
                        if !hash::is_zero(&stored) {
                            info.store_hash(current);
                            return Some(self.sym_or(info, FileEventKind::FileModified));
                        }
                        info.store_hash(current);
                    } else {
                        return Some(FileEventKind::FileAccessed);
                    }
                }
                Err(_) => {}
            }
            if fmod
                .mask
                .intersects(EventMask::CLOSE_WRITE | EventMask::MODIFY)
            {
                kind = self.sym_or(info, FileEventKind::FileModified);
            }
            return Some(kind);
        }

        log::debug!(
            "unclassified file event at {} mask {:?}",
            full_path.display(),
            fmod.mask
        );
        None
    }

    fn sym_or(&self, info: &FileInfo, kind: FileEventKind) -> FileEventKind {
        if kind == FileEventKind::FileModified && !info.link.is_empty() {
            FileEventKind::FileSymModified
        } else {
            kind
        }
    }

    /// Re-arm a path that re-appeared or was created inside a watched
    /// directory, attaching it to its parent's children when it is not
    /// a directory of its own.
    fn arm_appeared_path(&self, fmod: &FileMod, full_path: &Path, pid: i32, as_dir: bool) {
        let info = &fmod.info;
        let Some(appeared) = FileInfo::from_path(
            &info.container_id,
            full_path,
            pid,
            info.filter.clone(),
            info.protect,
            info.user_added,
        ) else {
            return;
        };
        let appeared = Arc::new(appeared);
        if as_dir {
            self.add_dir(true, appeared, HashMap::new());
        } else {
            let name = full_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.add_dir(
                true,
                info.clone(),
                HashMap::from([(name, appeared)]),
            );
        }
    }

    /// Feed the classified event into rule learning, apply the
    /// runtime-file grace period, and report.
    fn learn_from_events(&self, root_pid: i32, fmod: &FileMod, cpath: &str, kind: FileEventKind) {
        let (mode, start_at) = {
            let mut state = self.state.lock().unwrap();
            let Some(group) = state.groups.get_mut(&root_pid) else {
                return;
            };
            let mode = group.mode;
            if mode == PolicyMode::Learn && !fmod.procs.is_empty() {
                let matched: Vec<FileFilter> = group
                    .profile
                    .all_filters()
                    .filter(|f| f.user_added && filter::filter_path_match(cpath, f))
                    .cloned()
                    .collect();
                for f in &matched {
                    add_learned_rules(group, f, &fmod.procs);
                }
            }
            (mode, group.start_at)
        };

        // The container runtime rewrites these on boot; give it a
        // grace period before treating the writes as signal.
        if is_runtime_added_file(&format!("/root{cpath}")) {
            let young = start_at.elapsed() < RUNTIME_FILE_GRACE;
            if kind == FileEventKind::FileAccessed || young {
                self.mlog(format_args!("skip runtime file event at {cpath}"));
                return;
            }
        }

        if kind != FileEventKind::FileAccessed
            || matches!(mode, PolicyMode::Enforce | PolicyMode::Evaluate)
        {
            let mut path = cpath.to_string();
            if !fmod.info.link.is_empty() {
                path = strip_root_prefix(&fmod.info.link).to_string();
            }
            self.send_msg(&fmod.info.container_id, &path, kind, &fmod.procs);
        }
    }

    /// Emit one message per distinct initiating process, suppressing
    /// consecutive duplicates.
    fn send_msg(&self, id: &str, path: &str, kind: FileEventKind, procs: &[ProcInfo]) {
        self.mlog(format_args!(
            "event {kind:?} at {path} ({} processes)",
            procs.len()
        ));

        if procs.is_empty() {
            let mut msg = MonitorMessage::new(id, path, kind);
            msg.group =
                self.control
                    .estimate_rule_source(id, path, kind == FileEventKind::FileDenied);
            msg.package = is_package_path(path);
            self.control.send_report(msg);
            return;
        }

        let mut previous: Option<&ProcInfo> = None;
        for process in procs {
            if previous.is_some_and(|p| p == process) {
                log::debug!("duplicate process record for {path} suppressed");
                previous = Some(process);
                continue;
            }
            previous = Some(process);

            let mut msg = MonitorMessage::new(id, path, kind).with_process(process);
            let denied = kind == FileEventKind::FileDenied || process.deny;
            msg.group = self.control.estimate_rule_source(id, path, denied);
            msg.package = is_package_path(path);
            self.control.send_report(msg);
        }
    }

    /// Ship the learned-rule deltas. Failed batches are dropped; the
    /// controller re-derives them from future events.
    fn report_learning_rules(&self) {
        let mut batch = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for group in state.groups.values_mut() {
                if group.learn_rules.is_empty() {
                    continue;
                }
                let name = group.profile.group.clone();
                for (filter_key, paths) in group.learn_rules.drain() {
                    for path in paths {
                        batch.push(AccessRuleReq {
                            group: name.clone(),
                            filter: filter_key.clone(),
                            path,
                        });
                    }
                }
            }
        }
        if !batch.is_empty() {
            let count = batch.len();
            if let Err(e) = self.control.send_access_rules(batch) {
                log::error!("shipping {count} learned rules failed: {e}");
            }
        }
    }

    /// Start watching a container: derive the watch targets from the
    /// profile, arm the drivers, and register the group.
    pub async fn start_watch(
        &self,
        id: &str,
        root_pid: i32,
        conf: WatchConfig,
        cap_block: bool,
        is_agent: bool,
    ) {
        if !self.enabled {
            return;
        }
        log::debug!(
            "start watch: id={id} pid={root_pid} group={} mode={:?}",
            conf.profile.group,
            conf.profile.mode
        );
        if !procfs::is_pid_alive(root_pid) {
            log::debug!("start watch for dead pid {root_pid}");
            return;
        }

        let mut profile = conf.profile;
        let mode = profile.mode.unwrap_or(PolicyMode::Learn);
        profile.mode = Some(mode);

        let mut access = false;
        let mut perm = false;
        if mode == PolicyMode::Enforce && !self.aufs && cap_block {
            perm = true;
        } else if root_pid != 1 && !is_agent && mode == PolicyMode::Learn {
            // The host and the agent's own container are never
            // access-profiled; modifications still report.
            access = true;
        }

        let (dirs, singles) = self.get_core_file(root_pid, &profile).await;

        if let Some(fan) = &self.fan {
            fan.set_mode(root_pid, access, perm, cap_block, is_agent, id);
        }
        self.add_core_file(!is_agent, id, dirs, singles);
        if let Some(fan) = &self.fan {
            fan.start_monitor(root_pid);
        }

        {
            let mut state = self.state.lock().unwrap();
            let group = state.groups.entry(root_pid).or_insert_with(|| GroupInfo {
                is_agent,
                profile: MonitorProfile::default(),
                mode,
                apply_rules: HashMap::new(),
                learn_rules: HashMap::new(),
                start_at: Instant::now(),
            });
            group.profile = profile.clone();
            group.mode = mode;
        }

        // No access rules for the host or the agent itself.
        if is_agent || root_pid == 1 {
            return;
        }
        if let Some(rule) = conf.rule {
            self.update_access_rules(&profile.group, root_pid, &rule);
        }
    }

    /// Replace a group's applied access rules.
    pub fn update_access_rules(&self, name: &str, root_pid: i32, rule: &AccessRuleSet) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            let Some(group) = state.groups.get_mut(&root_pid) else {
                log::debug!("no group for {name} (pid {root_pid})");
                return;
            };
            group.apply_rules = rule
                .filters
                .iter()
                .filter(|(_, entry)| entry.user_added)
                .map(|(key, entry)| (key.clone(), entry.apps.iter().cloned().collect()))
                .collect();
        }
        if let Some(fan) = &self.fan {
            fan.update_access_rule(root_pid, rule);
        }
    }

    /// Tear down everything belonging to a container. With `leave` the
    /// group itself is dropped; otherwise only its rules reset, which
    /// profile reloads rely on.
    pub fn container_cleanup(&self, root_pid: i32, leave: bool) {
        if !self.enabled {
            return;
        }
        if let Some(fan) = &self.fan {
            fan.container_cleanup(root_pid);
        }
        if let Some(ino) = &self.ino {
            ino.container_cleanup(root_pid);
        }

        let mut state = self.state.lock().unwrap();
        state.file_events.retain(|path, _| {
            procfs::parse_container_file_path(path)
                .map(|(pid, _)| pid != root_pid)
                .unwrap_or(true)
        });
        if leave {
            state.groups.remove(&root_pid);
        } else if let Some(group) = state.groups.get_mut(&root_pid) {
            group.learn_rules.clear();
            group.apply_rules.clear();
        }
    }

    pub fn get_watch_file_list(&self, root_pid: i32) -> Vec<WatchedFile> {
        match (&self.fan, self.enabled) {
            (Some(fan), true) => fan.get_watch_file_list(root_pid),
            _ => Vec::new(),
        }
    }

    pub fn get_all_file_monitor_file(&self) -> Vec<WatchedFile> {
        match (&self.fan, self.enabled) {
            (Some(fan), true) => fan.get_watches(),
            _ => Vec::new(),
        }
    }

    pub fn probe_data(&self) -> Option<MonitorProbe> {
        if !self.enabled {
            return None;
        }
        let mut probe = MonitorProbe::default();
        {
            let state = self.state.lock().unwrap();
            probe.events = state.file_events.len();
            probe.groups = state.groups.len();
        }
        if let Some(fan) = &self.fan {
            probe.fan = fan.probe_data();
        }
        if let Some(ino) = &self.ino {
            probe.ino = ino.probe_data();
        }
        Some(probe)
    }

    /// Raise the monitor's own diagnostics to info level.
    pub fn set_monitor_trace(&self, enable: bool) {
        self.trace.store(enable, Ordering::Relaxed);
    }

    pub fn set_nv_protect_flag(&self, enable: bool) {
        log::info!("agent self-protection: {enable}");
        self.nv_protect.store(enable, Ordering::Relaxed);
        if let Some(fan) = &self.fan {
            fan.set_nv_protect(enable);
        }
    }

    fn send_agent_process_alert(&self, root_pid: i32, id: &str, path: &str, process: &ProcInfo) {
        let group = {
            let state = self.state.lock().unwrap();
            match state.groups.get(&root_pid) {
                Some(group) => group.profile.group.clone(),
                None => {
                    log::error!("agent alert for unknown group (pid {root_pid})");
                    return;
                }
            }
        };
        let mut msg = MonitorMessage::new(id, path, FileEventKind::FileDenied).with_process(process);
        msg.msg = AGENT_PROTECT_ALERT.to_string();
        msg.action = filegate_core::event::MonitorAction::Deny;
        msg.group = group;
        self.control.send_report(msg);
    }

    /// Stop the workers and release both kernel channels. Idempotent.
    pub fn close(&self) {
        if !self.enabled {
            return;
        }
        log::info!("file monitor closing");
        // Dropping the write end wakes both reader threads.
        self.end_channel.lock().unwrap().take();
        let _ = self.shutdown_tx.send(true);
    }

    async fn get_core_file(
        &self,
        pid: i32,
        profile: &MonitorProfile,
    ) -> (HashMap<PathBuf, TargetDir>, Vec<TargetFile>) {
        let dir_set: HashSet<String> = profile.all_filters().map(filter::base_prefix).collect();
        let res = match self.walker.walk(pid, dir_set.into_iter().collect()).await {
            Ok(res) => res,
            Err(e) => {
                // Watch what we can; an empty enumeration arms nothing.
                log::error!("walking the root of pid {pid} failed: {e}");
                return (HashMap::new(), Vec::new());
            }
        };

        let mut dir_list: HashMap<PathBuf, TargetDir> = HashMap::new();
        let mut singles = Vec::new();
        for f in profile.all_filters() {
            let (dirs, files) = filter::enumerate(pid, &res, f);
            for (path, dir) in dirs {
                match dir_list.get_mut(&path) {
                    Some(existing) => existing.children.extend(dir.children),
                    None => {
                        dir_list.insert(path, dir);
                    }
                }
            }
            singles.extend(files);
        }
        (dir_list, singles)
    }

    fn add_core_file(
        &self,
        inc_inotify: bool,
        id: &str,
        mut dirs: HashMap<PathBuf, TargetDir>,
        singles: Vec<TargetFile>,
    ) {
        // Files living directly under a watched directory ride on its
        // mark; runtime-added files keep their own so the grace logic
        // sees them individually.
        let mut leftover = Vec::new();
        for file in singles {
            let parent = PathBuf::from(parent_dir(&file.path.to_string_lossy()));
            match dirs.get_mut(&parent) {
                Some(dir) if !is_runtime_added_file(&file.path.to_string_lossy()) => {
                    let mut child = file;
                    child.filter = dir.filter.clone();
                    dir.children.push(child);
                }
                _ => leftover.push(file),
            }
        }

        for file in leftover {
            let info = Arc::new(FileInfo::from_target_file(id, &file));
            self.add_file(inc_inotify, info);
        }

        for (_, dir) in dirs {
            let children: HashMap<String, Arc<FileInfo>> = dir
                .children
                .iter()
                .filter_map(|child| {
                    child.path.file_name().map(|name| {
                        (
                            name.to_string_lossy().into_owned(),
                            Arc::new(FileInfo::from_target_file(id, child)),
                        )
                    })
                })
                .collect();
            let info = Arc::new(FileInfo::from_target_dir(id, &dir));
            self.add_dir(inc_inotify, info, children);
        }
    }

    fn add_file(&self, inc_inotify: bool, info: Arc<FileInfo>) {
        if let Some(fan) = &self.fan {
            fan.add_monitor_file(info.clone());
        }
        // Wildcard targets are already covered by their directory.
        if inc_inotify && !info.filter.key.ends_with("/.*") {
            if let Some(ino) = &self.ino {
                ino.add_monitor_file(&info.path, info.clone());
            }
        }
    }

    fn add_dir(&self, inc_inotify: bool, info: Arc<FileInfo>, children: HashMap<String, Arc<FileInfo>>) {
        if let Some(fan) = &self.fan {
            fan.add_monitor_dir_file(info.clone(), children);
        }
        if inc_inotify {
            if let Some(ino) = &self.ino {
                ino.add_monitor_dir_file(&info.path, info.clone());
            }
        }
    }

    fn remove_file(&self, path: &Path) {
        if let Some(fan) = &self.fan {
            fan.remove_monitor_file(path);
        }
        if let Some(ino) = &self.ino {
            ino.remove_monitor_file(path);
        }
    }

    fn is_armed(&self, path: &Path) -> bool {
        self.fan.as_ref().is_some_and(|fan| fan.has_target(path))
            || self.ino.as_ref().is_some_and(|ino| ino.is_watched(path))
    }

    fn mlog(&self, args: std::fmt::Arguments) {
        if self.trace.load(Ordering::Relaxed) {
            log::info!("{args}");
        } else {
            log::debug!("{args}");
        }
    }
}

fn add_learned_rules(group: &mut GroupInfo, filter: &FileFilter, procs: &[ProcInfo]) {
    let key = filter.key();
    let Some(apply) = group.apply_rules.get(&key) else {
        log::debug!("no applied rules for filter {key}");
        return;
    };
    // Only the process path goes into the learned profile.
    let fresh: Vec<String> = procs
        .iter()
        .filter(|p| !p.path.is_empty() && !apply.contains(&p.path))
        .map(|p| p.path.clone())
        .collect();
    if !fresh.is_empty() {
        group.learn_rules.entry(key).or_default().extend(fresh);
    }
}

/// Reported symlink targets drop everything through the container-root
/// component; targets outside any container root stay as the raw host
/// path.
fn strip_root_prefix(link: &str) -> &str {
    match link.find("/root/") {
        Some(index) if index > 0 => &link[index + 5..],
        _ => link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filegate_core::event::MonitorAction;
    use filegate_core::profile::FilterBehavior;

    #[derive(Default)]
    struct RecordingControl {
        reports: Mutex<Vec<MonitorMessage>>,
        rules: Mutex<Vec<Vec<AccessRuleReq>>>,
    }

    impl ControlPlane for RecordingControl {
        fn send_report(&self, msg: MonitorMessage) -> bool {
            self.reports.lock().unwrap().push(msg);
            true
        }

        fn send_access_rules(
            &self,
            rules: Vec<AccessRuleReq>,
        ) -> Result<(), filegate_core::ControlError> {
            self.rules.lock().unwrap().push(rules);
            Ok(())
        }

        fn estimate_rule_source(&self, id: &str, _path: &str, _denied: bool) -> String {
            format!("group.{id}")
        }
    }

    fn detached_monitor() -> (Arc<FileMonitor>, Arc<RecordingControl>) {
        let control = Arc::new(RecordingControl::default());
        let (shutdown_tx, _) = watch::channel(false);
        let monitor = Arc::new(FileMonitor {
            enabled: true,
            aufs: false,
            trace: AtomicBool::new(false),
            nv_protect: AtomicBool::new(false),
            fan: None,
            ino: None,
            state: Mutex::new(MonitorState::default()),
            control: control.clone(),
            walker: WalkerClient::new(Arc::new(LocalPathWalker)),
            end_channel: Mutex::new(None),
            shutdown_tx,
        });
        (monitor, control)
    }

    fn test_filter(path: &str, regex: &str, user_added: bool) -> FileFilter {
        let mut f = FileFilter::new(path, regex, true, FilterBehavior::Monitor);
        f.user_added = user_added;
        f
    }

    fn test_info(host_path: &Path, filter: &FileFilter, is_dir: bool) -> Arc<FileInfo> {
        Arc::new(FileInfo::new(
            "c1",
            host_path.to_path_buf(),
            is_dir,
            false,
            filter.user_added,
            String::new(),
            CompiledFilter::compile(filter),
        ))
    }

    fn insert_group(
        monitor: &FileMonitor,
        root_pid: i32,
        mode: PolicyMode,
        profile: MonitorProfile,
        age: Duration,
    ) {
        let start_at = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        monitor.state.lock().unwrap().groups.insert(
            root_pid,
            GroupInfo {
                is_agent: false,
                profile,
                mode,
                apply_rules: HashMap::new(),
                learn_rules: HashMap::new(),
                start_at,
            },
        );
    }

    fn self_pid() -> i32 {
        std::process::id() as i32
    }

    fn host_path(pid: i32, cpath: &str) -> PathBuf {
        procfs::container_file_path(pid, cpath)
    }

    fn proc_info(pid: i32, path: &str) -> ProcInfo {
        ProcInfo {
            root_pid: self_pid(),
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            path: path.to_string(),
            pid,
            ..Default::default()
        }
    }

    #[test]
    fn raw_events_merge_per_path() {
        let (monitor, _) = detached_monitor();
        let filter = test_filter("/etc/passwd", "", false);
        let path = host_path(self_pid(), "/etc/passwd");
        let info = test_info(&path, &filter, false);

        for mask in [EventMask::OPEN, EventMask::MODIFY] {
            monitor.on_raw_event(RawFileEvent {
                path: path.clone(),
                mask,
                info: info.clone(),
                process: Some(proc_info(100, "/usr/bin/vi")),
            });
        }
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::CLOSE_WRITE,
            info: info.clone(),
            process: Some(proc_info(101, "/usr/bin/sed")),
        });

        let state = monitor.state.lock().unwrap();
        assert_eq!(state.file_events.len(), 1);
        let pending = &state.file_events[&path];
        assert_eq!(
            pending.mask,
            EventMask::OPEN | EventMask::MODIFY | EventMask::CLOSE_WRITE
        );
        assert_eq!(pending.procs.len(), 2);
    }

    #[test]
    fn text_edit_reports_one_modification() {
        let (monitor, control) = detached_monitor();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("passwd");
        std::fs::write(&target, b"root:x:0:0").unwrap();

        let pid = self_pid();
        let cpath = target.to_string_lossy().into_owned();
        let path = host_path(pid, &cpath);
        let filter = test_filter(&cpath, "", false);
        let info = test_info(&path, &filter, false);

        insert_group(
            &monitor,
            pid,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::MODIFY | EventMask::CLOSE_WRITE,
            info,
            process: Some(proc_info(100, "/usr/bin/vi")),
        });
        monitor.handle_watched_files();

        let reports = control.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].msg, "File was modified.");
        assert_eq!(reports[0].action, MonitorAction::Violate);
        assert_eq!(reports[0].proc_path, "/usr/bin/vi");
        assert_eq!(reports[0].group, "group.c1");
    }

    #[test]
    fn modification_requires_a_changed_hash() {
        let (monitor, control) = detached_monitor();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ld.so");
        std::fs::write(&target, b"\x7fELF").unwrap();

        let pid = self_pid();
        let cpath = target.to_string_lossy().into_owned();
        let path = host_path(pid, &cpath);
        let filter = test_filter(&cpath, "", false);
        let info = test_info(&path, &filter, false);

        insert_group(
            &monitor,
            pid,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );

        // Establish the baseline hash with a first close-write event.
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::CLOSE_WRITE,
            info: info.clone(),
            process: None,
        });
        monitor.handle_watched_files();
        control.reports.lock().unwrap().clear();

        // A plain read leaves the content identical.
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::ACCESS,
            info: info.clone(),
            process: None,
        });
        monitor.handle_watched_files();
        {
            let reports = control.reports.lock().unwrap();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].msg, "File was accessed.");
        }
        control.reports.lock().unwrap().clear();

        // Content change flips the verdict to modified.
        std::fs::write(&target, b"\x7fELF-changed").unwrap();
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::CLOSE_WRITE,
            info,
            process: None,
        });
        monitor.handle_watched_files();
        let reports = control.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].msg, "File was modified.");
    }

    #[test]
    fn create_then_delete_in_one_window_cancels() {
        let (monitor, control) = detached_monitor();
        let dir = tempfile::tempdir().unwrap();

        let pid = self_pid();
        let dpath = dir.path().to_string_lossy().into_owned();
        let filter = test_filter(&dpath, ".*", false);
        let dir_info = test_info(&host_path(pid, &dpath), &filter, true);

        insert_group(
            &monitor,
            pid,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );
        let ghost = host_path(pid, &format!("{dpath}/ghost"));
        monitor.on_raw_event(RawFileEvent {
            path: ghost.clone(),
            mask: EventMask::CREATE,
            info: dir_info.clone(),
            process: None,
        });
        monitor.on_raw_event(RawFileEvent {
            path: ghost,
            mask: EventMask::DELETE,
            info: dir_info,
            process: None,
        });
        monitor.handle_watched_files();

        assert!(control.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn runtime_added_files_have_a_grace_period() {
        let (monitor, control) = detached_monitor();
        let pid = self_pid();
        let path = host_path(pid, "/etc/hosts");
        let filter = test_filter("/etc/hosts", "", false);
        let info = test_info(&path, &filter, false);

        // A five-second-old container: the runtime is still writing.
        insert_group(
            &monitor,
            pid,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(5),
        );
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::MODIFY | EventMask::CLOSE_WRITE,
            info,
            process: None,
        });
        monitor.handle_watched_files();

        assert!(control.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn accessed_is_consumed_not_reported_in_learn_mode() {
        let (monitor, control) = detached_monitor();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ls");
        std::fs::write(&target, b"binary").unwrap();

        let pid = self_pid();
        let dpath = dir.path().to_string_lossy().into_owned();
        let cpath = target.to_string_lossy().into_owned();
        let filter = test_filter(&dpath, ".*", true);
        let info = test_info(&host_path(pid, &cpath), &filter, false);

        let profile = MonitorProfile {
            group: "nv.app".to_string(),
            mode: Some(PolicyMode::Learn),
            filters: vec![filter.clone()],
            crd_filters: Vec::new(),
        };
        insert_group(&monitor, pid, PolicyMode::Learn, profile, Duration::from_secs(600));
        monitor
            .state
            .lock()
            .unwrap()
            .groups
            .get_mut(&pid)
            .unwrap()
            .apply_rules
            .insert(filter.key(), HashSet::new());

        monitor.on_raw_event(RawFileEvent {
            path: host_path(pid, &cpath),
            mask: EventMask::OPEN | EventMask::ACCESS,
            info,
            process: Some(proc_info(100, "/usr/bin/foo")),
        });
        monitor.handle_watched_files();

        // Consumed for learning, not reported.
        assert!(control.reports.lock().unwrap().is_empty());
        monitor.report_learning_rules();
        let batches = control.rules.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![AccessRuleReq {
                group: "nv.app".to_string(),
                filter: filter.key(),
                path: "/usr/bin/foo".to_string(),
            }]
        );
    }

    #[test]
    fn learned_rules_skip_applied_processes_and_non_customer_filters() {
        let (monitor, _) = detached_monitor();
        let pid = self_pid();
        let customer = test_filter("/bin", ".*", true);
        let stock = test_filter("/sbin", ".*", false);
        let profile = MonitorProfile {
            group: "nv.app".to_string(),
            mode: Some(PolicyMode::Learn),
            filters: vec![customer.clone(), stock.clone()],
            crd_filters: Vec::new(),
        };
        insert_group(&monitor, pid, PolicyMode::Learn, profile, Duration::from_secs(600));
        {
            let mut state = monitor.state.lock().unwrap();
            let group = state.groups.get_mut(&pid).unwrap();
            group.apply_rules.insert(
                customer.key(),
                HashSet::from(["/usr/bin/known".to_string()]),
            );
            group.apply_rules.insert(stock.key(), HashSet::new());
        }

        let info = test_info(&host_path(pid, "/bin/ls"), &customer, false);
        let fmod = FileMod {
            mask: EventMask::OPEN,
            info,
            procs: vec![proc_info(10, "/usr/bin/known"), proc_info(11, "/usr/bin/new")],
        };
        monitor.learn_from_events(pid, &fmod, "/bin/ls", FileEventKind::FileAccessed);

        let sbin_info = test_info(&host_path(pid, "/sbin/ip"), &stock, false);
        let sbin_mod = FileMod {
            mask: EventMask::OPEN,
            info: sbin_info,
            procs: vec![proc_info(12, "/usr/bin/other")],
        };
        monitor.learn_from_events(pid, &sbin_mod, "/sbin/ip", FileEventKind::FileAccessed);

        let state = monitor.state.lock().unwrap();
        let group = &state.groups[&pid];
        assert_eq!(
            group.learn_rules[&customer.key()],
            HashSet::from(["/usr/bin/new".to_string()])
        );
        // The applied process and the stock filter learned nothing.
        assert!(!group.learn_rules[&customer.key()].contains("/usr/bin/known"));
        assert!(!group.learn_rules.contains_key(&stock.key()));
    }

    #[test]
    fn consecutive_duplicate_processes_collapse() {
        let (monitor, control) = detached_monitor();
        let writer = proc_info(100, "/usr/bin/vi");
        let other = proc_info(101, "/usr/bin/sed");
        monitor.send_msg(
            "c1",
            "/etc/passwd",
            FileEventKind::FileModified,
            &[writer.clone(), writer.clone(), other],
        );
        let reports = control.reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].proc_path, "/usr/bin/vi");
        assert_eq!(reports[1].proc_path, "/usr/bin/sed");
    }

    #[test]
    fn denied_process_turns_the_action_into_deny() {
        let (monitor, control) = detached_monitor();
        let mut writer = proc_info(100, "/usr/bin/dd");
        writer.deny = true;
        monitor.send_msg("c1", "/etc/shadow", FileEventKind::FileAccessed, &[writer]);
        let reports = control.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, MonitorAction::Deny);
        assert_eq!(reports[0].msg, "File access was denied.");
    }

    #[test]
    fn cleanup_with_leave_drops_every_trace_of_the_group() {
        let (monitor, _) = detached_monitor();
        let pid = self_pid();
        let filter = test_filter("/etc/passwd", "", false);
        insert_group(
            &monitor,
            pid,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );
        insert_group(
            &monitor,
            1,
            PolicyMode::Evaluate,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );
        let path = host_path(pid, "/etc/passwd");
        monitor.on_raw_event(RawFileEvent {
            path: path.clone(),
            mask: EventMask::MODIFY,
            info: test_info(&path, &filter, false),
            process: None,
        });

        assert_eq!(monitor.probe_data().unwrap().groups, 2);
        monitor.container_cleanup(pid, true);

        let probe = monitor.probe_data().unwrap();
        assert_eq!(probe.groups, 1);
        assert_eq!(probe.events, 0);
        assert!(!monitor.state.lock().unwrap().groups.contains_key(&pid));
    }

    #[test]
    fn cleanup_without_leave_only_resets_rules() {
        let (monitor, _) = detached_monitor();
        let pid = self_pid();
        insert_group(
            &monitor,
            pid,
            PolicyMode::Learn,
            MonitorProfile::default(),
            Duration::from_secs(600),
        );
        {
            let mut state = monitor.state.lock().unwrap();
            let group = state.groups.get_mut(&pid).unwrap();
            group.apply_rules.insert("/bin/.*".to_string(), HashSet::new());
            group
                .learn_rules
                .entry("/bin/.*".to_string())
                .or_default()
                .insert("/usr/bin/foo".to_string());
        }

        monitor.container_cleanup(pid, false);

        let state = monitor.state.lock().unwrap();
        let group = &state.groups[&pid];
        assert!(group.apply_rules.is_empty());
        assert!(group.learn_rules.is_empty());
    }

    #[test]
    fn symlink_report_paths_strip_the_container_root() {
        assert_eq!(
            strip_root_prefix("/proc/42/root/etc/alternatives/editor"),
            "/etc/alternatives/editor"
        );
        assert_eq!(strip_root_prefix("/mnt/backing/file"), "/mnt/backing/file");
    }
}
