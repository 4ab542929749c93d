// Progress watchdog: tails every child's progress file, aggregates the
// stage's progress into one console line, and escalates strikes against
// children that stop making progress. A frozen interpolation worker is
// relaunched with the alternate filter family instead of failing the run.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::commands;
use super::progress::{self, ProgressFrame, ProgressState};
use super::registry::{ChildStatus, Registry, StageParams};
use super::supervisor;
use crate::error::{PipelineError, PipelineResult};
use crate::{log_debug, log_status, log_warning};

/// Watchdog tick length.
pub const TICK: Duration = Duration::from_millis(500);

/// Ticks without a `progress=continue` frame before a child counts as
/// frozen (240 half-seconds, about two minutes).
pub const TIMEOUT_INTERVALS: i32 = 240;

/// Hard ceiling for the final drain before SIGKILL.
const DRAIN_KILL_DEADLINE: Duration = Duration::from_secs(10);

/// What a strike count demands. The table is sparse on purpose: between the
/// named strikes the watchdog just keeps counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeAction {
    None,
    Term,
    Kill,
    Reap,
    Restart,
}

pub fn strike_action(strikes: u32) -> StrikeAction {
    match strikes {
        1 => StrikeAction::Term,
        7 => StrikeAction::Kill,
        13 => StrikeAction::Reap,
        s if s > 17 => StrikeAction::Restart,
        _ => StrikeAction::None,
    }
}

/// Per-pid escalation state, owned by the watchdog.
#[derive(Debug)]
struct Escalation {
    timeout_ticks: i32,
    strikes: u32,
    ended: bool,
    /// Last observed (frame, out_time) pair. A `progress=continue` frame
    /// only counts as progress when it moved past this; a wedged encoder
    /// leaves its last continue frame in place forever.
    last_seen: Option<(u64, u64)>,
}

impl Escalation {
    fn new(timeout_ticks: i32) -> Self {
        Self {
            timeout_ticks,
            strikes: 0,
            ended: false,
            last_seen: None,
        }
    }
}

/// Final accounting for one child of a finished stage.
#[derive(Debug, Clone)]
pub struct ChildReport {
    pub pid: u32,
    pub gid: u32,
    pub exit_code: i32,
    pub error_msg: String,
    pub stdout: String,
    pub stderr: String,
    pub stage_params: Option<StageParams>,
}

/// Outcome of one watched stage.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    /// High-water aggregate across the stage (cumulative fields hold the
    /// maxima the summed frames reached).
    pub aggregate: ProgressFrame,
    pub children: Vec<ChildReport>,
    pub restarts: u32,
}

pub struct Watchdog {
    registry: Arc<Registry>,
    tick_len: Duration,
    timeout_intervals: i32,
    escalation: HashMap<u32, Escalation>,
    high_water: ProgressFrame,
    restarts: u32,
    line_len: usize,
}

impl Watchdog {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_timing(registry, TICK, TIMEOUT_INTERVALS)
    }

    /// Same watchdog, custom cadence. The pipeline uses the defaults; the
    /// knobs exist so supervision can be exercised at test speed.
    pub fn with_timing(registry: Arc<Registry>, tick_len: Duration, timeout_intervals: i32) -> Self {
        Self {
            registry,
            tick_len,
            timeout_intervals,
            escalation: HashMap::new(),
            high_water: ProgressFrame::default(),
            restarts: 0,
            line_len: 0,
        }
    }

    /// Watch the current registry population until every child is done,
    /// then drain and report. Returns Terminated when the death level rose.
    pub fn run_stage(&mut self, label: &str) -> PipelineResult<StageReport> {
        self.escalation.clear();
        self.high_water = ProgressFrame::default();
        self.restarts = 0;
        let total = self.registry.snapshot_pids().len();

        loop {
            self.pump_signals();
            let death = self.registry.read_death();
            if death >= 1 {
                self.clear_line();
                self.drain();
                log_warning!("{label}: terminated at death level {death}");
                return Err(PipelineError::Terminated(format!(
                    "death level {death} during {label}"
                )));
            }

            let running = match self.tick() {
                Ok(running) => running,
                Err(e) => {
                    // Ask the supervisors to take their children down,
                    // then wait them out; nothing may outlive the stage.
                    self.registry.raise_death(1);
                    self.clear_line();
                    self.drain();
                    return Err(e);
                }
            };
            self.render(running, total);

            if running == 0 {
                break;
            }
            std::thread::sleep(self.tick_len);
        }

        self.clear_line();
        let children = self.drain();
        let report = StageReport {
            aggregate: self.high_water.clone(),
            children,
            restarts: self.restarts,
        };
        log_status!(
            "{label}: {}",
            progress::render_progress_line(0, total, &report.aggregate)
        );
        Ok(report)
    }

    /// Abort path teardown: drain whatever is still registered.
    pub fn abort_drain(&mut self) {
        self.clear_line();
        self.drain();
    }

    /// Map pending termination signals onto the death level.
    fn pump_signals(&self) {
        let signals = crate::signals::signal_count();
        if signals > 0 {
            self.registry.raise_death(signals.min(5) as u8);
        }
    }

    /// One pass over every child: parse progress, keep score, escalate.
    /// Returns how many children are still going (or owed a restart).
    fn tick(&mut self) -> PipelineResult<usize> {
        let pids = self.registry.snapshot_pids();
        let timeout_reset = self.timeout_intervals;
        let mut tick_agg = ProgressFrame::default();
        let mut running = 0;

        for pid in pids {
            let Some((status, progress_path, restart_requested)) =
                self.registry.with_record(pid, |r| {
                    (r.status(), r.progress_path.clone(), r.restart_requested)
                })
            else {
                continue;
            };

            let state = progress_path
                .as_deref()
                .and_then(progress::read_tail)
                .map(|tail| progress::parse_latest_frame(&tail))
                .unwrap_or_default();

            let esc = self
                .escalation
                .entry(pid)
                .or_insert_with(|| Escalation::new(timeout_reset));

            match state.state {
                ProgressState::Continue => {
                    let seen = (state.frame, state.out_time_us);
                    if esc.last_seen != Some(seen) {
                        esc.last_seen = Some(seen);
                        esc.timeout_ticks = timeout_reset;
                    } else if status == ChildStatus::Running {
                        // Same frame as last tick: the file is not moving.
                        esc.timeout_ticks -= 1;
                    }
                    tick_agg.accumulate(&state);
                }
                ProgressState::Ended => {
                    esc.timeout_ticks = timeout_reset;
                    esc.ended = true;
                    tick_agg.accumulate(&state);
                }
                ProgressState::None => {
                    // Children without a progress file (probe, stream
                    // copies, the final encode) are exempt from freeze
                    // detection.
                    if status == ChildStatus::Running && progress_path.is_some() {
                        esc.timeout_ticks -= 1;
                    }
                }
            }

            if status.is_exited() && !restart_requested {
                esc.ended = true;
            }
            if !esc.ended {
                running += 1;
            }

            if esc.timeout_ticks <= 0 && (status == ChildStatus::Running || restart_requested) {
                esc.strikes += 1;
                let strikes = esc.strikes;
                self.apply_strike(pid, strikes)?;
            }
        }

        merge_high_water(&mut self.high_water, &tick_agg);
        Ok(running)
    }

    fn apply_strike(&mut self, pid: u32, strikes: u32) -> PipelineResult<()> {
        match strike_action(strikes) {
            StrikeAction::None => {}
            StrikeAction::Term => {
                log_warning!("worker {pid} frozen, strike {strikes}: sending TERM");
                supervisor::send_signal(pid, libc::SIGTERM);
                self.registry.mark_restart(pid);
            }
            StrikeAction::Kill => {
                log_warning!("worker {pid} frozen, strike {strikes}: sending KILL");
                supervisor::send_signal(pid, libc::SIGKILL);
                self.registry.mark_restart(pid);
            }
            StrikeAction::Reap => {
                log_warning!("worker {pid} frozen, strike {strikes}: reaping");
                if self.registry.get_status(pid).is_some_and(|s| s.is_exited()) {
                    self.registry.set_status(pid, ChildStatus::Reaped);
                }
            }
            StrikeAction::Restart => {
                self.restart_child(pid)?;
            }
        }
        Ok(())
    }

    /// Relaunch a frozen interpolation worker with the alternate filter
    /// family. The old record goes away without cleanup; its progress file
    /// is deleted here so the replacement starts from a clean tail.
    fn restart_child(&mut self, pid: u32) -> PipelineResult<()> {
        let fields = self.registry.with_record(pid, |r| {
            (
                r.gid,
                r.stage_params.clone(),
                r.progress_path.clone(),
                r.source_path.clone(),
                r.target_path.clone(),
            )
        });
        let Some((gid, Some(mut params), Some(progress_path), Some(source), Some(target))) = fields
        else {
            return Err(PipelineError::WorkerCrash(format!(
                "worker {pid} is frozen but carries no restartable stage parameters"
            )));
        };

        params.alt_algorithm = true;
        let argv = commands::interp_argv(&source, &target, &progress_path, &params);
        let _ = std::fs::remove_file(&progress_path);

        log_warning!(
            "worker {pid} unresponsive past all strikes; restarting slot {} with the classic interpolation family",
            params.target_slot
        );

        let new_pid = supervisor::spawn(&self.registry, argv, gid)
            .map_err(|e| PipelineError::WorkerCrash(format!("restart of worker {pid}: {e}")))?;
        self.registry.with_record(new_pid, |r| {
            r.stage_params = Some(params.clone());
            r.progress_path = Some(progress_path.clone());
            r.source_path = Some(source.clone());
            r.target_path = Some(target.clone());
        });
        self.registry.set_status(new_pid, ChildStatus::Running);

        // Old record out, no cleanup: the replacement owns the paths now.
        self.registry.set_status(pid, ChildStatus::Reaped);
        self.registry.remove(pid, false);
        self.escalation.remove(&pid);
        self.escalation
            .insert(new_pid, Escalation::new(self.timeout_intervals));
        self.restarts += 1;
        log_debug!("worker {pid} replaced by {new_pid}");
        Ok(())
    }

    /// Wait out every remaining child with graduated TERM windows and a
    /// hard KILL deadline, then reap and remove all records (with cleanup).
    fn drain(&mut self) -> Vec<ChildReport> {
        let pids = self.registry.snapshot_pids();
        let start = Instant::now();
        let mut term_sent: HashMap<u32, bool> = HashMap::new();
        let mut kill_sent: HashMap<u32, bool> = HashMap::new();

        loop {
            let mut alive = 0;
            for (index, &pid) in pids.iter().enumerate() {
                let status = self.registry.get_status(pid);
                let exited = status.map(|s| s >= ChildStatus::Killed).unwrap_or(true);
                if exited {
                    continue;
                }
                alive += 1;

                // Stragglers get 3/4/5/6/7 seconds before TERM, ten
                // before KILL.
                let term_window = Duration::from_secs((3 + index as u64).min(7));
                if start.elapsed() >= term_window && !term_sent.get(&pid).copied().unwrap_or(false)
                {
                    supervisor::send_signal(pid, libc::SIGTERM);
                    term_sent.insert(pid, true);
                }
                if start.elapsed() >= DRAIN_KILL_DEADLINE
                    && !kill_sent.get(&pid).copied().unwrap_or(false)
                {
                    supervisor::send_signal(pid, libc::SIGKILL);
                    kill_sent.insert(pid, true);
                }
            }
            if alive == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let mut reports = Vec::new();
        for pid in pids {
            let report = self.registry.with_record(pid, |r| ChildReport {
                pid,
                gid: r.gid,
                exit_code: r.exit_code,
                error_msg: r.error_msg.clone(),
                stdout: std::mem::take(&mut r.stdout_buf),
                stderr: std::mem::take(&mut r.stderr_buf),
                stage_params: r.stage_params.clone(),
            });
            if let Some(report) = report {
                self.registry.set_status(pid, ChildStatus::Reaped);
                self.registry.remove(pid, true);
                reports.push(report);
            }
            self.escalation.remove(&pid);
        }
        reports.sort_by_key(|r| r.pid);
        reports
    }

    fn render(&mut self, running: usize, total: usize) {
        let line = progress::render_progress_line(running, total, &self.high_water);
        let padding = self.line_len.saturating_sub(line.len());
        print!("\r{line}{}", " ".repeat(padding));
        let _ = std::io::stdout().flush();
        self.line_len = line.len();
    }

    fn clear_line(&mut self) {
        if self.line_len > 0 {
            print!("\r{}\r", " ".repeat(self.line_len));
            let _ = std::io::stdout().flush();
            self.line_len = 0;
        }
    }
}

/// Fold a tick's summed frame into the stage high-water aggregate.
/// Cumulative counters only move forward; the rate fields track the tick.
fn merge_high_water(high_water: &mut ProgressFrame, tick: &ProgressFrame) {
    high_water.frame = high_water.frame.max(tick.frame);
    high_water.drop_frames = high_water.drop_frames.max(tick.drop_frames);
    high_water.dup_frames = high_water.dup_frames.max(tick.dup_frames);
    high_water.out_time_us = high_water.out_time_us.max(tick.out_time_us);
    high_water.total_size = high_water.total_size.max(tick.total_size);
    if tick.fps > 0.0 {
        high_water.fps = tick.fps;
    }
    if tick.bitrate_bps > 0 {
        high_water.bitrate_bps = tick.bitrate_bps;
    }
}
