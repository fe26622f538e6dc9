//! End-to-end polling scenarios against a simulated host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use usbmirrord::adapters::{HostAdapters, SimulatedHost};
use usbmirrord::config::AppConfig;
use usbmirrord::context::AppContext;
use usbmirrord::core::mirror::{NativeCopyEngine, SimulatedEngine};
use usbmirrord::core::{DeviceKey, DeviceRecord, Orchestrator, TickReport, TrackerState, Transport};

fn usb_stick(id: &str, mountpoint: impl Into<PathBuf>) -> DeviceRecord {
    DeviceRecord::new(id, Transport::Usb)
        .with_child(DeviceRecord::new(format!("{id}1"), Transport::Unknown).with_mountpoint(mountpoint))
}

fn config(backup_directory: &Path) -> AppConfig {
    AppConfig {
        backup_directory: backup_directory.to_path_buf(),
        forbidden_mountpoints: BTreeMap::from([(PathBuf::from("/"), "root filesystem".to_string())]),
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn test_plugged_stick_is_mirrored_to_disk() {
    let temp = tempdir().unwrap();
    let mount = temp.path().join("media/HOLIDAY");
    std::fs::create_dir_all(mount.join("photos")).unwrap();
    std::fs::write(mount.join("photos/beach.jpg"), b"sand").unwrap();
    std::fs::write(mount.join("notes.txt"), b"remember sunscreen").unwrap();

    let backups = temp.path().join("backups");
    let host = SimulatedHost::new();
    host.plug(usb_stick("sdb", &mount));

    let ctx = AppContext::with_collaborators(
        config(&backups),
        HostAdapters::simulated(&host),
        Arc::new(NativeCopyEngine::default()),
    );
    let orchestrator = Orchestrator::new(ctx);
    let mut state = TrackerState::default();

    let report = orchestrator.tick(&mut state).await;
    let summary = report.summary().expect("tick completed");
    assert_eq!(summary.mirrored, vec![DeviceKey::new("sdb", &mount)]);

    let target = backups.join("HOLIDAY");
    assert_eq!(std::fs::read(target.join("photos/beach.jpg")).unwrap(), b"sand");
    assert_eq!(std::fs::read(target.join("notes.txt")).unwrap(), b"remember sunscreen");

    // Deleted on the stick, re-plugged: the mirror follows.
    std::fs::remove_file(mount.join("notes.txt")).unwrap();
    host.unplug("sdb");
    orchestrator.tick(&mut state).await;
    assert!(state.is_empty());

    host.plug(usb_stick("sdb", &mount));
    orchestrator.tick(&mut state).await;
    assert!(state.is_tracked(&DeviceKey::new("sdb", &mount)));
    assert!(!target.join("notes.txt").exists());
    assert!(target.join("photos/beach.jpg").exists());
}

#[tokio::test]
async fn test_stick_unplugged_before_mirror_is_retried_later() {
    let temp = tempdir().unwrap();
    let mount = temp.path().join("media/STICK");
    let backups = temp.path().join("backups");

    // Listed by the host but not actually mounted yet.
    let host = SimulatedHost::new();
    host.plug(usb_stick("sdc", &mount));

    let ctx = AppContext::with_collaborators(
        config(&backups),
        HostAdapters::simulated(&host),
        Arc::new(NativeCopyEngine::default()),
    );
    let orchestrator = Orchestrator::new(ctx);
    let mut state = TrackerState::default();
    let key = DeviceKey::new("sdc", &mount);

    let report = orchestrator.tick(&mut state).await;
    assert_eq!(report.summary().unwrap().failed, vec![key.clone()]);
    assert!(!backups.join("STICK").exists());
    assert_eq!(state.failures(&key), 1);

    std::fs::create_dir_all(&mount).unwrap();
    std::fs::write(mount.join("late.txt"), b"here now").unwrap();

    let report = orchestrator.tick(&mut state).await;
    assert_eq!(report.summary().unwrap().mirrored, vec![key.clone()]);
    assert_eq!(state.failures(&key), 0);
    assert!(backups.join("STICK/late.txt").exists());
}

#[tokio::test]
async fn test_query_failure_keeps_tracked_devices() {
    let temp = tempdir().unwrap();
    let host = SimulatedHost::new();
    let engine = SimulatedEngine::default();
    host.plug(usb_stick("sdb", "/media/usb1"));

    let ctx = AppContext::with_collaborators(
        config(temp.path()),
        HostAdapters::simulated(&host),
        Arc::new(engine.clone()),
    );
    let orchestrator = Orchestrator::new(ctx);
    let mut state = TrackerState::default();

    orchestrator.tick(&mut state).await;
    assert_eq!(state.len(), 1);

    host.fail_next_queries(1);
    assert!(matches!(
        orchestrator.tick(&mut state).await,
        TickReport::QueryFailed(_)
    ));
    assert_eq!(state.len(), 1);

    orchestrator.tick(&mut state).await;
    assert_eq!(engine.call_count(), 1);
}

#[tokio::test]
async fn test_bus_probe_failure_keeps_tracked_devices() {
    let temp = tempdir().unwrap();
    let host = SimulatedHost::new();
    let engine = SimulatedEngine::default();
    host.plug(usb_stick("sdb", "/media/usb1"));

    let ctx = AppContext::with_collaborators(
        config(temp.path()),
        HostAdapters::simulated(&host),
        Arc::new(engine.clone()),
    );
    let orchestrator = Orchestrator::new(ctx);
    let mut state = TrackerState::default();

    orchestrator.tick(&mut state).await;
    let tracked = state.tracked_keys();
    assert_eq!(tracked.len(), 1);

    // A stick without a transport tag needs the udev lookup, which fails once.
    host.plug(
        DeviceRecord::new("sdc", Transport::Unknown)
            .with_child(DeviceRecord::new("sdc1", Transport::Unknown).with_mountpoint("/media/usb2")),
    );
    host.mark_usb("sdc");
    host.fail_next_probes(1);

    assert!(matches!(
        orchestrator.tick(&mut state).await,
        TickReport::QueryFailed(_)
    ));
    assert_eq!(state.tracked_keys(), tracked);
    assert_eq!(engine.call_count(), 1);

    let report = orchestrator.tick(&mut state).await;
    assert_eq!(
        report.summary().unwrap().mirrored,
        vec![DeviceKey::new("sdc", "/media/usb2")]
    );
    assert_eq!(state.len(), 2);
}

#[tokio::test]
async fn test_run_mirrors_until_cancelled() {
    let temp = tempdir().unwrap();
    let host = SimulatedHost::new();
    let engine = SimulatedEngine::default();
    host.plug(usb_stick("sdb", "/media/usb1"));

    let ctx = AppContext::with_collaborators(
        config(temp.path()),
        HostAdapters::simulated(&host),
        Arc::new(engine.clone()),
    );
    let orchestrator = Orchestrator::new(ctx).with_poll_interval(Duration::from_millis(10));
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { orchestrator.run(shutdown).await }
    });

    timeout(Duration::from_secs(5), async {
        while engine.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first device mirrored");

    host.plug(usb_stick("sdc", "/media/usb2"));
    timeout(Duration::from_secs(5), async {
        while engine.call_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second device mirrored");

    // Several more polls go by without re-mirroring either stick.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.call_count(), 2);

    shutdown.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon stops promptly")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_cancel_interrupts_slow_mirror() {
    let temp = tempdir().unwrap();
    let host = SimulatedHost::new();
    let engine = SimulatedEngine::with_delay(Duration::from_secs(60));
    host.plug(usb_stick("sdb", "/media/usb1"));

    let ctx = AppContext::with_collaborators(
        config(temp.path()),
        HostAdapters::simulated(&host),
        Arc::new(engine.clone()),
    );
    let orchestrator = Orchestrator::new(ctx);
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { orchestrator.run(shutdown).await }
    });

    timeout(Duration::from_secs(5), async {
        while engine.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("mirror started");

    shutdown.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancellation does not wait for the mirror")
        .unwrap()
        .unwrap();
}
