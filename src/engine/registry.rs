// Shared work registry: every running external command has one record here

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::log_debug;

/// Lifecycle of one supervised child.
///
/// CREATED → RUNNING → (FINISHED | KILLED) → REAPED. The numeric order
/// matters: everything below REAPED counts as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChildStatus {
    Created = 0,
    Running = 1,
    Killed = 2,
    Finished = 3,
    Reaped = 4,
}

impl ChildStatus {
    fn from_u8(v: u8) -> ChildStatus {
        match v {
            0 => ChildStatus::Created,
            1 => ChildStatus::Running,
            2 => ChildStatus::Killed,
            3 => ChildStatus::Finished,
            _ => ChildStatus::Reaped,
        }
    }

    pub fn is_exited(self) -> bool {
        matches!(self, ChildStatus::Killed | ChildStatus::Finished)
    }
}

/// Status lives in an atomic shared with the supervisor thread, so the
/// child-exit path can flip FINISHED/KILLED without touching the map lock.
/// Readers must tolerate the value changing under them at any time.
pub type StatusCell = Arc<AtomicU8>;

/// Which interpolation pass a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpPass {
    Up,
    Down,
}

/// Per-worker interpolation parameters, kept so a frozen worker can be
/// relaunched with the alternate filter family.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub pass: InterpPass,
    pub decim_max: u32,
    pub decim_frac: f64,
    pub target_fps: u32,
    pub source_slot: usize,
    pub target_slot: usize,
    pub use_mixer: bool,
    pub alt_algorithm: bool,
}

/// One supervised external command.
#[derive(Debug)]
pub struct ChildRecord {
    pub pid: u32,
    pub gid: u32,
    pub argv: Vec<String>,
    pub stage_params: Option<StageParams>,
    pub progress_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub target_path: Option<PathBuf>,
    pub stdout_buf: String,
    pub stderr_buf: String,
    pub exit_code: i32,
    pub error_msg: String,
    pub restart_requested: bool,
    status: StatusCell,
}

impl ChildRecord {
    fn new(pid: u32, gid: u32) -> Self {
        Self {
            pid,
            gid,
            argv: Vec::new(),
            stage_params: None,
            progress_path: None,
            source_path: None,
            target_path: None,
            stdout_buf: String::new(),
            stderr_buf: String::new(),
            exit_code: 0,
            error_msg: String::new(),
            restart_requested: false,
            status: Arc::new(AtomicU8::new(ChildStatus::Created as u8)),
        }
    }

    pub fn status(&self) -> ChildStatus {
        ChildStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn status_cell(&self) -> StatusCell {
        Arc::clone(&self.status)
    }
}

/// Process-wide registry of supervised children plus the death level.
///
/// Lock discipline: one exclusive lock, taken once per public operation,
/// never re-entrant. The death level and per-record status are atomics and
/// stay readable from supervisor threads without the lock.
pub struct Registry {
    children: Mutex<HashMap<u32, ChildRecord>>,
    death: AtomicU8,
    lock_debug: AtomicBool,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            children: Mutex::new(HashMap::new()),
            death: AtomicU8::new(0),
            lock_debug: AtomicBool::new(false),
        })
    }

    pub fn set_lock_debug(&self, enabled: bool) {
        self.lock_debug.store(enabled, Ordering::SeqCst);
    }

    fn lock(&self, op: &str) -> MutexGuard<'_, HashMap<u32, ChildRecord>> {
        if self.lock_debug.load(Ordering::SeqCst) {
            log_debug!("registry lock: {op}");
        }
        // A poisoned lock means a supervisor thread panicked; the map itself
        // is still usable and teardown must keep working.
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a freshly spawned pid in CREATED status.
    pub fn add(&self, pid: u32, gid: u32) -> Result<(), String> {
        let mut children = self.lock("add");
        if children.contains_key(&pid) {
            return Err(format!("duplicate pid {pid}"));
        }
        children.insert(pid, ChildRecord::new(pid, gid));
        Ok(())
    }

    /// Drop a record. With `cleanup` the record's progress file is deleted
    /// too. Removing an unknown pid succeeds (idempotent once reaped);
    /// removing a child that has not exited yet is refused.
    pub fn remove(&self, pid: u32, cleanup: bool) -> bool {
        let mut children = self.lock("remove");
        let Some(record) = children.get(&pid) else {
            return true;
        };
        if record.status() < ChildStatus::Killed {
            return false;
        }
        let record = children.remove(&pid).expect("checked above");
        drop(children);

        if cleanup {
            if let Some(path) = &record.progress_path {
                let _ = std::fs::remove_file(path);
            }
        }
        true
    }

    pub fn set_status(&self, pid: u32, status: ChildStatus) {
        let children = self.lock("set_status");
        if let Some(record) = children.get(&pid) {
            record.status.store(status as u8, Ordering::SeqCst);
        }
    }

    pub fn get_status(&self, pid: u32) -> Option<ChildStatus> {
        let children = self.lock("get_status");
        children.get(&pid).map(|r| r.status())
    }

    pub fn mark_restart(&self, pid: u32) {
        let mut children = self.lock("mark_restart");
        if let Some(record) = children.get_mut(&pid) {
            record.restart_requested = true;
        }
    }

    pub fn shall_restart(&self, pid: u32) -> bool {
        let children = self.lock("shall_restart");
        children
            .get(&pid)
            .map(|r| r.restart_requested)
            .unwrap_or(false)
    }

    pub fn snapshot_pids(&self) -> Vec<u32> {
        let children = self.lock("snapshot_pids");
        let mut pids: Vec<u32> = children.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Number of records that have not reached REAPED.
    pub fn active_count(&self) -> usize {
        let children = self.lock("active_count");
        children
            .values()
            .filter(|r| r.status() < ChildStatus::Reaped)
            .count()
    }

    /// Raise the death level. Monotone: a lower level never overwrites a
    /// higher one.
    pub fn raise_death(&self, level: u8) {
        self.death.fetch_max(level, Ordering::SeqCst);
    }

    pub fn read_death(&self) -> u8 {
        self.death.load(Ordering::SeqCst)
    }

    /// Run `f` against one record under the lock.
    pub fn with_record<T>(&self, pid: u32, f: impl FnOnce(&mut ChildRecord) -> T) -> Option<T> {
        let mut children = self.lock("with_record");
        children.get_mut(&pid).map(f)
    }

    pub fn append_stdout(&self, pid: u32, line: &str) {
        self.with_record(pid, |r| {
            r.stdout_buf.push_str(line);
            r.stdout_buf.push('\n');
        });
    }

    pub fn append_stderr(&self, pid: u32, line: &str) {
        self.with_record(pid, |r| {
            r.stderr_buf.push_str(line);
            r.stderr_buf.push('\n');
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_duplicate_pid() {
        let registry = Registry::new();
        assert!(registry.add(100, 1).is_ok());
        let err = registry.add(100, 1).unwrap_err();
        assert!(err.contains("duplicate pid"));
        assert!(registry.add(101, 1).is_ok());
        assert_eq!(registry.snapshot_pids(), vec![100, 101]);
    }

    #[test]
    fn test_active_count_tracks_non_reaped() {
        let registry = Registry::new();
        registry.add(1, 0).unwrap();
        registry.add(2, 0).unwrap();
        assert_eq!(registry.active_count(), 2);

        registry.set_status(1, ChildStatus::Running);
        registry.set_status(1, ChildStatus::Finished);
        assert_eq!(registry.active_count(), 2);

        registry.set_status(1, ChildStatus::Reaped);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_remove_refuses_live_children() {
        let registry = Registry::new();
        registry.add(7, 0).unwrap();
        registry.set_status(7, ChildStatus::Running);
        assert!(!registry.remove(7, false));

        registry.set_status(7, ChildStatus::Finished);
        assert!(registry.remove(7, false));
        // Idempotent once gone.
        assert!(registry.remove(7, false));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_remove_with_cleanup_deletes_progress_file() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("worker.prg");
        std::fs::write(&progress, "progress=continue\n").unwrap();

        let registry = Registry::new();
        registry.add(9, 2).unwrap();
        registry.with_record(9, |r| r.progress_path = Some(progress.clone()));
        registry.set_status(9, ChildStatus::Killed);

        assert!(registry.remove(9, true));
        assert!(!progress.exists());
    }

    #[test]
    fn test_restart_flag() {
        let registry = Registry::new();
        registry.add(5, 1).unwrap();
        assert!(!registry.shall_restart(5));
        registry.mark_restart(5);
        assert!(registry.shall_restart(5));
        assert!(!registry.shall_restart(999));
    }

    #[test]
    fn test_death_level_is_monotone() {
        let registry = Registry::new();
        assert_eq!(registry.read_death(), 0);
        registry.raise_death(2);
        registry.raise_death(1);
        assert_eq!(registry.read_death(), 2);
        registry.raise_death(5);
        assert_eq!(registry.read_death(), 5);
    }

    #[test]
    fn test_status_cell_is_shared() {
        let registry = Registry::new();
        registry.add(3, 0).unwrap();
        let cell = registry.with_record(3, |r| r.status_cell()).unwrap();
        cell.store(ChildStatus::Finished as u8, Ordering::SeqCst);
        assert_eq!(registry.get_status(3), Some(ChildStatus::Finished));
    }
}
