//! Translation of declarative profile filters into concrete watch
//! targets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;

use filegate_core::procfs;
use filegate_core::profile::{FileFilter, FilterBehavior};

use crate::walker::WalkResult;

/// The slice of a profile filter the watch tables carry at runtime.
#[derive(Debug)]
pub struct CompiledFilter {
    /// `"<path>/<regex>"`, the stable filter identity.
    pub key: String,
    pub recursive: bool,
}

impl CompiledFilter {
    pub fn compile(filter: &FileFilter) -> Arc<CompiledFilter> {
        Arc::new(CompiledFilter {
            key: filter.key(),
            recursive: filter.recursive,
        })
    }
}

/// `filepath.Dir` semantics: the path up to the last separator.
pub(crate) fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Base directory prefix a filter derives its walk from: unescape
/// `\.`, truncate at the first `.*`, and for exact-path filters take
/// the parent directory.
pub fn base_prefix(filter: &FileFilter) -> String {
    let mut dir = filter.path.replace("\\.", ".");
    if let Some(index) = dir.find(".*") {
        if index > 0 {
            dir.truncate(index - 1);
        }
    }
    if filter.regex.is_empty() {
        dir = parent_dir(&dir);
    }
    dir
}

/// Whether a container path matches a filter: exact path when the
/// filter carries no regex, otherwise the anchored
/// `^<dir(path)>/<regex>$` pattern.
pub fn filter_path_match(path: &str, filter: &FileFilter) -> bool {
    if filter.regex.is_empty() {
        filter.path == path
    } else {
        let fstr = format!("{}/{}", parent_dir(path), filter.regex);
        match Regex::new(&format!("^{fstr}$")) {
            Ok(regex) => regex.is_match(path),
            Err(_) => false,
        }
    }
}

/// A resolved single-file watch target.
#[derive(Debug, Clone)]
pub struct TargetFile {
    /// Host-side path, `/proc/<pid>/root/<container path>`.
    pub path: PathBuf,
    pub mode: u32,
    pub filter: Arc<CompiledFilter>,
    pub protect: bool,
    pub user_added: bool,
}

/// A resolved directory watch target with the files matched under it.
#[derive(Debug, Clone)]
pub struct TargetDir {
    pub path: PathBuf,
    pub mode: u32,
    pub children: Vec<TargetFile>,
    pub filter: Arc<CompiledFilter>,
    pub protect: bool,
    pub user_added: bool,
}

/// Select the directories and files of a walk result that fall under
/// one filter. Files directly under a selected directory are attached
/// to it; the rest come back as single-file targets.
pub fn enumerate(
    pid: i32,
    res: &WalkResult,
    filter: &FileFilter,
) -> (HashMap<PathBuf, TargetDir>, Vec<TargetFile>) {
    let mut dirs: HashMap<PathBuf, TargetDir> = HashMap::new();
    let mut singles: Vec<TargetFile> = Vec::new();

    let base = filter.path.replace("\\.", ".");
    let base_d = format!("{base}/");
    let compiled = CompiledFilter::compile(filter);
    let protect = filter.behavior == FilterBehavior::Block;

    for d in &res.dirs {
        if d.path != base && !d.path.starts_with(&base_d) {
            continue;
        }
        if !filter.recursive && d.path.len() > base.len() {
            continue;
        }
        let fpath = procfs::container_file_path(pid, &d.path);
        dirs.insert(
            fpath.clone(),
            TargetDir {
                path: fpath,
                mode: d.mode,
                children: Vec::new(),
                filter: compiled.clone(),
                protect,
                user_added: filter.user_added,
            },
        );
    }

    for f in &res.files {
        if f.path != base {
            if !f.path.starts_with(&base_d) {
                continue;
            }

            let fstr = format!("{}/{}", parent_dir(&f.path), filter.regex);
            if let Ok(regex) = Regex::new(&format!("^{fstr}$")) {
                if !regex.is_match(&f.path) {
                    continue;
                }
            }

            if !filter.recursive && parent_dir(&f.path) != base {
                continue;
            }
        }

        let fpath = procfs::container_file_path(pid, &f.path);
        let file = TargetFile {
            path: fpath,
            mode: f.mode,
            filter: compiled.clone(),
            protect,
            user_added: filter.user_added,
        };

        let parent = PathBuf::from(parent_dir(&file.path.to_string_lossy()));
        if let Some(di) = dirs.get_mut(&parent) {
            di.children.push(file);
        } else {
            singles.push(file);
        }
    }

    (dirs, singles)
}
