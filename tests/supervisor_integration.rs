/// Integration tests running real /bin/sh children through the registry and
/// the supervisor: spawn, startup handshake, output capture, exit decoding,
/// and the death-level termination contract.
use std::sync::Arc;
use std::time::{Duration, Instant};

use reframe::engine::registry::{ChildStatus, Registry};
use reframe::engine::supervisor;

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn wait_for_exit(registry: &Arc<Registry>, pid: u32, limit: Duration) -> ChildStatus {
    let start = Instant::now();
    loop {
        let status = registry.get_status(pid).expect("record present");
        if status.is_exited() {
            return status;
        }
        assert!(
            start.elapsed() < limit,
            "child {pid} did not exit within {limit:?}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn clean_exit_captures_output_and_status() {
    let registry = Registry::new();
    let pid = supervisor::spawn(&registry, sh("echo hello; echo oops >&2"), 1).unwrap();

    assert_eq!(registry.get_status(pid), Some(ChildStatus::Created));
    registry.set_status(pid, ChildStatus::Running);

    let status = wait_for_exit(&registry, pid, Duration::from_secs(5));
    assert_eq!(status, ChildStatus::Finished);

    registry
        .with_record(pid, |r| {
            assert_eq!(r.exit_code, 0);
            assert!(r.error_msg.is_empty());
            assert!(r.stdout_buf.contains("hello"), "stdout: {}", r.stdout_buf);
            assert!(r.stderr_buf.contains("oops"), "stderr: {}", r.stderr_buf);
            assert_eq!(r.gid, 1);
        })
        .unwrap();

    assert!(registry.remove(pid, false));
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn nonzero_exit_is_decoded() {
    let registry = Registry::new();
    let pid = supervisor::spawn(&registry, sh("exit 3"), 0).unwrap();
    registry.set_status(pid, ChildStatus::Running);

    let status = wait_for_exit(&registry, pid, Duration::from_secs(5));
    assert_eq!(status, ChildStatus::Killed);
    registry
        .with_record(pid, |r| {
            assert_eq!(r.exit_code, 3);
            assert_eq!(r.error_msg, "Exited with error 3");
        })
        .unwrap();
}

#[test]
fn output_pumping_waits_for_running_handshake() {
    let registry = Registry::new();
    let pid = supervisor::spawn(&registry, sh("echo ready"), 0).unwrap();

    // While the record sits in CREATED the supervisor has not started
    // pumping, even though the child already ran.
    std::thread::sleep(Duration::from_millis(200));
    let buffered = registry
        .with_record(pid, |r| r.stdout_buf.clone())
        .unwrap();
    assert!(buffered.is_empty(), "pumped before handshake: {buffered}");
    assert_eq!(registry.get_status(pid), Some(ChildStatus::Created));

    registry.set_status(pid, ChildStatus::Running);
    wait_for_exit(&registry, pid, Duration::from_secs(5));
    let buffered = registry
        .with_record(pid, |r| r.stdout_buf.clone())
        .unwrap();
    assert!(buffered.contains("ready"));
}

#[test]
fn raised_death_level_terminates_child_promptly() {
    let registry = Registry::new();
    let pid = supervisor::spawn(&registry, sh("sleep 30"), 0).unwrap();
    registry.set_status(pid, ChildStatus::Running);

    // Give the supervisor a moment to enter its pump loop, then ask for
    // termination; the TERM must land within the 200 ms contract.
    std::thread::sleep(Duration::from_millis(100));
    registry.raise_death(1);
    let asked = Instant::now();

    let status = wait_for_exit(&registry, pid, Duration::from_secs(2));
    assert!(asked.elapsed() < Duration::from_millis(1000));
    assert_eq!(status, ChildStatus::Killed);
    registry
        .with_record(pid, |r| {
            assert_eq!(r.exit_code, libc::SIGTERM);
            assert_eq!(r.error_msg, "Killed by signal 15");
        })
        .unwrap();
    assert!(!supervisor::process_alive(pid));
}

#[test]
fn spawn_failure_reports_instead_of_registering() {
    let registry = Registry::new();
    let err = supervisor::spawn(
        &registry,
        vec!["/nonexistent/definitely-not-a-binary".to_string()],
        0,
    )
    .unwrap_err();
    assert!(err.to_string().contains("failed to spawn"));
    assert_eq!(registry.active_count(), 0);
}
