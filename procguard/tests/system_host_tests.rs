//! Tests against the real [`SystemHost`]. Kept in their own binary because
//! the panic hook is process-global state.

use std::time::Duration;

use procguard::{Fault, ProcessHost, SystemHost};
use tokio::sync::mpsc;

/// An uncaught panic anywhere in the process reaches a fault watcher with
/// its message and location.
#[tokio::test]
async fn panic_hook_forwards_panics_to_fault_watchers() {
    let host = SystemHost::new();
    let (tx, mut rx) = mpsc::channel(4);
    let id = host.watch_faults(tx);

    let worker = std::thread::spawn(|| panic!("worker exploded"));
    assert!(worker.join().is_err());

    let fault = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for fault")
        .expect("fault delivered");
    match fault {
        Fault::Panic { message, location } => {
            assert!(message.contains("worker exploded"));
            assert!(location.is_some());
        }
        other => panic!("unexpected fault: {other}"),
    }

    host.unwatch_faults(id);
}

#[test]
fn pid_reports_the_current_process() {
    let host = SystemHost::new();
    assert_eq!(host.pid(), std::process::id());
}
