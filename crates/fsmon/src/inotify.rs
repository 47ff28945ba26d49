//! Inotify driver.
//!
//! Keeps a `path <-> wd` table and forwards normalized events to the
//! aggregator. Watches the kernel dropped on its own (`IN_IGNORED`,
//! `IN_UNMOUNT`) are released from the table and delivered upstream as
//! removes so no watch descriptor ever leaks.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::inotify::{Event, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::sync::mpsc::UnboundedSender;

use filegate_core::event::InotifyProbe;

use crate::mask::EventMask;
use crate::{wait_event_fd, FileInfo, FsmonError, MonitorEvent, RawFileEvent};

fn file_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::MODIFY
        | WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_TO
}

struct InoEntry {
    wd: WatchDescriptor,
    is_dir: bool,
    info: Arc<FileInfo>,
}

struct InoTables {
    watches: Watches,
    by_wd: HashMap<WatchDescriptor, PathBuf>,
    paths: HashMap<PathBuf, InoEntry>,
}

pub(crate) struct InotifyDriver {
    tables: Mutex<InoTables>,
    tx: UnboundedSender<MonitorEvent>,
}

impl InotifyDriver {
    pub(crate) fn new(
        tx: UnboundedSender<MonitorEvent>,
        end: Arc<OwnedFd>,
    ) -> Result<Arc<InotifyDriver>, FsmonError> {
        let inotify = Inotify::init().map_err(FsmonError::InotifyInit)?;
        let watches = inotify.watches();

        let driver = Arc::new(InotifyDriver {
            tables: Mutex::new(InoTables {
                watches,
                by_wd: HashMap::new(),
                paths: HashMap::new(),
            }),
            tx,
        });

        let reader = driver.clone();
        std::thread::Builder::new()
            .name("fsmon-inotify".to_string())
            .spawn(move || reader.read_loop(inotify, end))
            .map_err(FsmonError::InotifyInit)?;

        Ok(driver)
    }

    fn read_loop(&self, mut inotify: Inotify, end: Arc<OwnedFd>) {
        let mut buffer = [0u8; 4096];
        while wait_event_fd(inotify.as_raw_fd(), &end) {
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        for event in events {
                            self.handle_event(&event);
                        }
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("inotify read failed: {e}");
                        return;
                    }
                }
            }
        }
        log::debug!("inotify reader exits");
    }

    fn handle_event(&self, event: &Event<&std::ffi::OsStr>) {
        let mask = EventMask::from_inotify_bits(event.mask.bits());

        let mut tables = self.tables.lock().unwrap();
        let Some(base) = tables.by_wd.get(&event.wd).cloned() else {
            return;
        };
        let info = tables.paths.get(&base).map(|e| e.info.clone());

        if mask.intersects(EventMask::IGNORED | EventMask::UNMOUNT) {
            // The kernel already released the watch.
            tables.by_wd.remove(&event.wd);
            tables.paths.remove(&base);
        }
        drop(tables);

        let path = match event.name {
            Some(name) if !name.is_empty() => base.join(name),
            _ => base,
        };
        let Some(info) = info else { return };

        log::trace!("inotify event {mask:?} at {}", path.display());
        let _ = self.tx.send(MonitorEvent::File(RawFileEvent {
            path,
            mask,
            info,
            process: None,
        }));
    }

    fn add(&self, path: &Path, mask: WatchMask, is_dir: bool, info: Arc<FileInfo>) -> bool {
        let mut tables = self.tables.lock().unwrap();
        match tables.watches.add(path, mask) {
            Ok(wd) => {
                tables.by_wd.insert(wd.clone(), path.to_path_buf());
                tables.paths.insert(
                    path.to_path_buf(),
                    InoEntry { wd, is_dir, info },
                );
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("adding inotify watch for {} failed: {e}", path.display());
                false
            }
        }
    }

    /// Watch a single file target.
    pub(crate) fn add_monitor_file(&self, path: &Path, info: Arc<FileInfo>) -> bool {
        self.add(path, file_mask(), false, info)
    }

    /// Watch a directory target. The watch does not follow a symlink
    /// standing in for the directory.
    pub(crate) fn add_monitor_dir_file(&self, path: &Path, info: Arc<FileInfo>) -> bool {
        self.add(path, file_mask() | WatchMask::DONT_FOLLOW, true, info)
    }

    pub(crate) fn remove_monitor_file(&self, path: &Path) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.paths.remove(path) {
            tables.by_wd.remove(&entry.wd);
            // The wd may already be gone if the kernel sent IN_IGNORED.
            let _ = tables.watches.remove(entry.wd);
        }
    }

    /// Drop every watch under the root of a departed container.
    pub(crate) fn container_cleanup(&self, root_pid: i32) {
        let root = PathBuf::from(format!("/proc/{root_pid}/root"));
        let mut tables = self.tables.lock().unwrap();
        let doomed: Vec<PathBuf> = tables
            .paths
            .keys()
            .filter(|p| p.starts_with(&root))
            .cloned()
            .collect();
        for path in doomed {
            if let Some(entry) = tables.paths.remove(&path) {
                tables.by_wd.remove(&entry.wd);
                let _ = tables.watches.remove(entry.wd);
            }
        }
    }

    pub(crate) fn is_watched(&self, path: &Path) -> bool {
        self.tables.lock().unwrap().paths.contains_key(path)
    }

    pub(crate) fn probe_data(&self) -> InotifyProbe {
        let tables = self.tables.lock().unwrap();
        InotifyProbe {
            wds: tables.by_wd.len(),
            paths: tables.paths.len(),
            dirs: tables.paths.values().filter(|e| e.is_dir).count(),
        }
    }
}
