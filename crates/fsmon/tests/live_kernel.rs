//! End-to-end scenarios against a live kernel.
//!
//! These arm real fanotify and inotify marks and therefore need root
//! (CAP_SYS_ADMIN) on a fanotify-capable kernel:
//!
//! ```sh
//! sudo -E cargo test -p fsmon --test live_kernel -- --ignored
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use filegate_core::event::MonitorMessage;
use filegate_core::process::{ControlError, ControlPlane, ProcInfo, ProcessLookup};
use filegate_core::procfs;
use filegate_core::profile::{FileFilter, FilterBehavior, MonitorProfile, PolicyMode};
use fsmon::{FileMonitor, LocalPathWalker, MonitorConfig, WatchConfig};

#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<MonitorMessage>>,
}

impl Recorder {
    fn paths_with(&self, msg: &str) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.msg == msg)
            .map(|m| m.path.clone())
            .collect()
    }
}

impl ControlPlane for Recorder {
    fn send_report(&self, msg: MonitorMessage) -> bool {
        self.reports.lock().unwrap().push(msg);
        true
    }

    fn send_access_rules(&self, _rules: Vec<filegate_core::AccessRuleReq>) -> Result<(), ControlError> {
        Ok(())
    }

    fn estimate_rule_source(&self, _id: &str, _path: &str, _denied: bool) -> String {
        "nodes".to_string()
    }
}

struct Lookup;

impl ProcessLookup for Lookup {
    fn process_info(&self, pid: i32) -> Option<ProcInfo> {
        Some(ProcInfo {
            root_pid: 1,
            name: procfs::process_comm(pid).ok()?,
            path: procfs::process_image(pid)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            pid,
            ..Default::default()
        })
    }
}

fn monitor_with(control: Arc<Recorder>) -> Arc<FileMonitor> {
    FileMonitor::new(MonitorConfig {
        profile_enable: true,
        is_aufs: false,
        enable_trace: true,
        nv_protect: false,
        walker: Arc::new(LocalPathWalker),
        lookup: Arc::new(Lookup),
        control,
    })
    .expect("opening kernel notification channels (are you root?)")
}

fn exact_file_profile(path: &str, mode: PolicyMode) -> MonitorProfile {
    MonitorProfile {
        group: "nodes".to_string(),
        mode: Some(mode),
        filters: vec![FileFilter::new(path, "", false, FilterBehavior::Monitor)],
        crd_filters: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a fanotify-capable kernel"]
async fn text_edit_is_reported_within_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("passwd");
    std::fs::write(&target, b"root:x:0:0").unwrap();

    let control = Arc::new(Recorder::default());
    let monitor = monitor_with(control.clone());
    let profile = exact_file_profile(&target.to_string_lossy(), PolicyMode::Evaluate);
    monitor
        .start_watch("", 1, WatchConfig { profile, rule: None }, false, false)
        .await;

    std::fs::write(&target, b"root:x:0:0:changed").unwrap();

    // One aggregation window plus slack.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let modified = control.paths_with("File was modified.");
    assert_eq!(modified.len(), 1, "expected exactly one modification report");
    assert!(modified[0].ends_with("/passwd"));

    monitor.close();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a fanotify-capable kernel"]
async fn created_and_removed_children_report_in_watched_directories() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("app");
    std::fs::create_dir(&base).unwrap();

    let control = Arc::new(Recorder::default());
    let monitor = monitor_with(control.clone());
    let profile = MonitorProfile {
        group: "nodes".to_string(),
        mode: Some(PolicyMode::Evaluate),
        filters: vec![FileFilter::new(
            &base.to_string_lossy(),
            ".*",
            true,
            FilterBehavior::Monitor,
        )],
        crd_filters: Vec::new(),
    };
    monitor
        .start_watch("", 1, WatchConfig { profile, rule: None }, false, false)
        .await;

    let sub = base.join("sub");
    std::fs::create_dir(&sub).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(control.paths_with("Directory was created.").len(), 1);

    // The fresh subdirectory must be armed before its children appear.
    std::fs::write(sub.join("bin"), b"#!/bin/sh").unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        control
            .paths_with("File created in watched directory.")
            .len(),
        1
    );

    monitor.close();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires root and a fanotify-capable kernel"]
async fn container_cleanup_releases_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("shadow");
    std::fs::write(&target, b"secret").unwrap();

    let control = Arc::new(Recorder::default());
    let monitor = monitor_with(control.clone());
    let profile = exact_file_profile(&target.to_string_lossy(), PolicyMode::Evaluate);
    monitor
        .start_watch("", 1, WatchConfig { profile, rule: None }, false, false)
        .await;

    let before = monitor.probe_data().unwrap();
    assert_eq!(before.groups, 1);

    monitor.container_cleanup(1, true);

    let after = monitor.probe_data().unwrap();
    assert_eq!(after.groups, 0);
    assert_eq!(after.fan.paths, 0);
    assert_eq!(after.ino.paths, 0);

    // Nothing reports after the cleanup.
    control.reports.lock().unwrap().clear();
    std::fs::write(&target, b"changed").unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(control.reports.lock().unwrap().is_empty());

    monitor.close();
}
