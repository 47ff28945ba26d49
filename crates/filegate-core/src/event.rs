//! Outbound event taxonomy and report types.

use serde::Serialize;

use crate::process::ProcInfo;

/// The classified file events the monitor can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileEventKind {
    FileAttr,
    DirAttr,
    FileCreated,
    FileModified,
    FileRemoved,
    FileSymCreated,
    FileSymModified,
    DirSymCreated,
    DirSymModified,
    FileReplaced,
    DirCreated,
    DirRemoved,
    FileAccessed,
    FileDenied,
    FileMovedFrom,
    FileMovedTo,
    DirMovedFrom,
    DirMovedTo,
}

impl FileEventKind {
    /// Canonical human-readable message for the event.
    pub fn message(&self) -> &'static str {
        match self {
            FileEventKind::FileAttr => "File attribute is changed.",
            FileEventKind::DirAttr => "Directory attribute is changed.",
            FileEventKind::FileModified => "File was modified.",
            FileEventKind::FileReplaced => "File was replaced.",
            FileEventKind::FileCreated => "File created in watched directory.",
            FileEventKind::FileRemoved => "File deleted from watched directory.",
            FileEventKind::FileSymCreated => "File symlink was created.",
            FileEventKind::FileSymModified => "File symlink was modified.",
            FileEventKind::DirSymCreated => "Directory symlink was created.",
            FileEventKind::DirSymModified => "Directory symlink was modified.",
            FileEventKind::DirCreated => "Directory was created.",
            FileEventKind::DirRemoved => "Directory was deleted.",
            FileEventKind::FileAccessed => "File was accessed.",
            FileEventKind::FileDenied => "File access was denied.",
            FileEventKind::FileMovedFrom => "File was moved from.",
            FileEventKind::FileMovedTo => "File was moved to.",
            FileEventKind::DirMovedFrom => "Directory was moved from.",
            FileEventKind::DirMovedTo => "Directory was moved to.",
        }
    }
}

/// Action the monitor took, or would have taken, for a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorAction {
    Violate,
    Deny,
}

impl std::fmt::Display for MonitorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorAction::Violate => f.write_str("violate"),
            MonitorAction::Deny => f.write_str("deny"),
        }
    }
}

/// One alert shipped through the report callback.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorMessage {
    /// Container id, empty for the host.
    pub id: String,
    /// Path inside the container.
    pub path: String,
    /// Whether the path belongs to a package-manager database.
    pub package: bool,
    pub proc_name: String,
    pub proc_path: String,
    pub proc_cmds: Vec<String>,
    pub proc_pid: i32,
    pub proc_euid: u32,
    pub proc_euser: String,
    pub proc_ppid: i32,
    pub proc_pname: String,
    pub proc_ppath: String,
    /// Group the event is attributed to.
    pub group: String,
    pub msg: String,
    pub count: u32,
    pub action: MonitorAction,
}

impl MonitorMessage {
    pub fn new(id: &str, path: &str, kind: FileEventKind) -> Self {
        MonitorMessage {
            id: id.to_string(),
            path: path.to_string(),
            package: false,
            proc_name: String::new(),
            proc_path: String::new(),
            proc_cmds: Vec::new(),
            proc_pid: 0,
            proc_euid: 0,
            proc_euser: String::new(),
            proc_ppid: 0,
            proc_pname: String::new(),
            proc_ppath: String::new(),
            group: String::new(),
            msg: kind.message().to_string(),
            count: 1,
            action: MonitorAction::Violate,
        }
    }

    /// Attach the identity of the initiating process.
    pub fn with_process(mut self, proc: &ProcInfo) -> Self {
        self.proc_name = proc.name.clone();
        self.proc_path = proc.path.clone();
        self.proc_cmds = proc.cmds.clone();
        self.proc_pid = proc.pid;
        self.proc_euid = proc.euid;
        self.proc_euser = proc.euser.clone();
        self.proc_ppid = proc.ppid;
        self.proc_pname = proc.pname.clone();
        self.proc_ppath = proc.ppath.clone();
        if proc.deny {
            self.action = MonitorAction::Deny;
            self.msg = FileEventKind::FileDenied.message().to_string();
        }
        self
    }
}

/// One watched target as listed through the watch-list queries.
#[derive(Debug, Clone, Serialize)]
pub struct WatchedFile {
    pub path: String,
    pub is_dir: bool,
    pub protect: bool,
    /// Known children, for directory targets.
    pub files: Vec<String>,
}

/// Counters of the fanotify driver tables.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FanotifyProbe {
    pub roots: usize,
    pub mount_roots: usize,
    pub dir_marks: usize,
    pub rules: usize,
    pub paths: usize,
    pub dirs: usize,
}

/// Counters of the inotify driver tables.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InotifyProbe {
    pub wds: usize,
    pub paths: usize,
    pub dirs: usize,
}

/// Snapshot of the monitor internals, for the probe query.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MonitorProbe {
    pub events: usize,
    pub groups: usize,
    pub fan: FanotifyProbe,
    pub ino: InotifyProbe,
}
