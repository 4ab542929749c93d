// Stage orchestration: build argv, fan out the workers, hold the watchdog
// until the registry drains, then judge the outcome. Stages run strictly in
// sequence; a failure stops the pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use super::commands;
use super::planner::{Job, ProbeBounds, SLOTS, SourceGroup};
use super::registry::{ChildStatus, InterpPass, Registry, StageParams};
use super::supervisor;
use super::watchdog::{StageReport, Watchdog};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::{log_debug, log_error, log_info};

/// Decimation parameters per pass.
const UP_DECIM_MAX: u32 = 3;
const UP_DECIM_FRAC: f64 = 0.33;
const DOWN_DECIM_MAX: u32 = 2;
const DOWN_DECIM_FRAC: f64 = 0.5;

/// Lines the encoder classifies as errors with `-loglevel level+...`.
fn stderr_has_errors(stderr: &str) -> Option<&str> {
    stderr.lines().find(|line| {
        line.contains("[error]") || line.contains("[fatal]") || line.contains("[panic]")
    })
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    watchdog: Watchdog,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>) -> Self {
        let watchdog = Watchdog::new(Arc::clone(&registry));
        Self { registry, watchdog }
    }

    /// No stage starts over a populated registry. A breach here is an
    /// invariant failure: everything is torn down.
    fn ensure_drained(&self, stage: Stage) -> PipelineResult<()> {
        if self.registry.active_count() == 0 {
            return Ok(());
        }
        self.registry.raise_death(5);
        let backtrace = std::backtrace::Backtrace::force_capture();
        log_error!(
            "registry not drained before {} stage\n{backtrace}",
            stage.name()
        );
        Err(PipelineError::Terminated(format!(
            "registry not drained before {} stage",
            stage.name()
        )))
    }

    /// Error-path teardown: no child may outlive the pipeline. The
    /// supervisors observe the raised death level within their IO tick and
    /// forward TERM; the drain escalates to KILL if anything lingers.
    pub fn shutdown(&mut self) {
        if self.registry.active_count() == 0 {
            return;
        }
        self.registry.raise_death(1);
        self.watchdog.abort_drain();
    }

    /// Judge a finished stage: every worker must exit 0 and no stderr line
    /// may be error-classed.
    fn check_report(&self, stage: Stage, report: &StageReport) -> PipelineResult<()> {
        for child in &report.children {
            if child.exit_code != 0 {
                return Err(PipelineError::StageFailed {
                    stage,
                    msg: format!("worker {}: {}", child.pid, child.error_msg),
                });
            }
            if let Some(line) = stderr_has_errors(&child.stderr) {
                return Err(PipelineError::StageFailed {
                    stage,
                    msg: format!("worker {}: {line}", child.pid),
                });
            }
        }
        Ok(())
    }

    /// Run a single supervised command through the watchdog.
    fn run_single(
        &mut self,
        stage: Stage,
        argv: Vec<String>,
        gid: u32,
    ) -> PipelineResult<StageReport> {
        self.ensure_drained(stage)?;
        log_debug!("{}: {}", stage.name(), argv.join(" "));

        let pid = supervisor::spawn(&self.registry, argv, gid)
            .map_err(|e| PipelineError::WorkerCrash(e.to_string()))?;
        self.registry.set_status(pid, ChildStatus::Running);

        let report = self.watchdog.run_stage(stage.name())?;
        self.check_report(stage, &report)?;
        Ok(report)
    }

    /// Probe one input; returns the probe tool's stdout for parsing.
    pub fn probe(&mut self, input: &PathBuf, bounds: Option<&ProbeBounds>) -> PipelineResult<String> {
        let argv = commands::probe_argv(input, bounds);
        let report = self.run_single(Stage::Probe, argv, 0)?;
        let stdout = report
            .children
            .first()
            .map(|c| c.stdout.clone())
            .unwrap_or_default();
        if stdout.is_empty() {
            return Err(PipelineError::StageFailed {
                stage: Stage::Probe,
                msg: format!("probe produced no output for {}", input.display()),
            });
        }
        Ok(stdout)
    }

    /// Concatenate a multi-source group into its `cat` file. Single-source
    /// groups already alias `cat` to the source and never get here.
    pub fn concat(&mut self, job: &Job, group: &SourceGroup) -> PipelineResult<()> {
        let sources: Vec<PathBuf> = group
            .source_ids
            .iter()
            .map(|&idx| job.sources[idx].path.clone())
            .collect();
        commands::write_list(&sources, &group.templates.lst).map_err(|e| {
            PipelineError::StageFailed {
                stage: Stage::Concat,
                msg: format!("writing {}: {e}", group.templates.lst.display()),
            }
        })?;

        log_info!(
            "concatenating {} sources of group {}",
            sources.len(),
            group.id
        );
        let argv = commands::concat_argv(&group.templates.lst, &group.templates.cat);
        self.run_single(Stage::Concat, argv, group.id)?;
        Ok(())
    }

    /// Cut the group's concatenation into four equal segments.
    pub fn segment(&mut self, group: &SourceGroup) -> PipelineResult<()> {
        log_info!(
            "segmenting group {} into {} x {} s",
            group.id,
            SLOTS,
            group.segment_time_s()
        );
        let argv = commands::segment_argv(
            &group.cat_path,
            group.segment_time_s(),
            &group.templates.tmp_pattern,
        );
        self.run_single(Stage::Segment, argv, group.id)?;
        Ok(())
    }

    /// One interpolation pass over a group: four parallel workers, one per
    /// slot. Returns the drop+dup frames the pass observed.
    pub fn interp(
        &mut self,
        job: &Job,
        group: &SourceGroup,
        pass: InterpPass,
    ) -> PipelineResult<u64> {
        let stage = match pass {
            InterpPass::Up => Stage::InterpUp,
            InterpPass::Down => Stage::InterpDown,
        };
        self.ensure_drained(stage)?;

        log_info!(
            "group {}: {} pass at {} fps, {} workers",
            group.id,
            stage.name(),
            match pass {
                InterpPass::Up => job.max_fps,
                InterpPass::Down => job.target_fps,
            },
            SLOTS
        );

        for slot in 0..SLOTS {
            let params = StageParams {
                pass,
                decim_max: match pass {
                    InterpPass::Up => UP_DECIM_MAX,
                    InterpPass::Down => DOWN_DECIM_MAX,
                },
                decim_frac: match pass {
                    InterpPass::Up => UP_DECIM_FRAC,
                    InterpPass::Down => DOWN_DECIM_FRAC,
                },
                target_fps: match pass {
                    InterpPass::Up => job.max_fps,
                    InterpPass::Down => job.target_fps,
                },
                source_slot: slot,
                target_slot: slot,
                // Sources already running faster than the ceiling need the
                // quality mixer on the way up; the down pass always mixes.
                use_mixer: match pass {
                    InterpPass::Up => group.max_fps > job.max_fps,
                    InterpPass::Down => true,
                },
                alt_algorithm: false,
            };

            let t = &group.templates;
            let (source, target, progress) = match pass {
                InterpPass::Up => (&t.tmp[slot], &t.iup[slot], &t.prgu[slot]),
                InterpPass::Down => (&t.iup[slot], &t.idn[slot], &t.prgd[slot]),
            };

            let argv = commands::interp_argv(source, target, progress, &params);
            log_debug!("{} slot {slot}: {}", stage.name(), argv.join(" "));

            let pid = supervisor::spawn(&self.registry, argv, group.id)
                .map_err(|e| PipelineError::WorkerCrash(e.to_string()))?;
            self.registry.with_record(pid, |r| {
                r.stage_params = Some(params.clone());
                r.progress_path = Some(progress.clone());
                r.source_path = Some(source.clone());
                r.target_path = Some(target.clone());
            });
            self.registry.set_status(pid, ChildStatus::Running);
        }

        let report = self.watchdog.run_stage(stage.name())?;
        self.check_report(stage, &report)?;
        if report.restarts > 0 {
            log_info!(
                "group {}: {} pass recovered {} frozen worker(s)",
                group.id,
                stage.name(),
                report.restarts
            );
        }
        Ok(report.aggregate.drop_frames + report.aggregate.dup_frames)
    }

    /// Write the job-level lists the assemble stage consumes: every group's
    /// down-interpolated slots, and every group's concatenation result for
    /// the audio side.
    pub fn write_assembly_lists(&self, job: &Job) -> PipelineResult<()> {
        let mut video: Vec<PathBuf> = Vec::new();
        let mut audio: Vec<PathBuf> = Vec::new();
        for group in &job.groups {
            video.extend(group.templates.idn.iter().cloned());
            audio.push(group.cat_path.clone());
        }

        commands::write_list(&video, &job.assembly_list).map_err(|e| {
            PipelineError::StageFailed {
                stage: Stage::WriteList,
                msg: format!("writing {}: {e}", job.assembly_list.display()),
            }
        })?;
        commands::write_list(&audio, &job.audio_list).map_err(|e| {
            PipelineError::StageFailed {
                stage: Stage::WriteList,
                msg: format!("writing {}: {e}", job.audio_list.display()),
            }
        })?;
        Ok(())
    }

    /// The final encode into the output container (and the voice `.wav`
    /// sibling when requested).
    pub fn assemble(&mut self, job: &Job) -> PipelineResult<()> {
        let use_mixer = job.job_dropdups() > 0;
        log_info!(
            "assembling {} at {} fps ({})",
            job.output_path.display(),
            job.target_fps,
            if use_mixer {
                "quality mixer, drop/dup frames were seen"
            } else {
                "plain frame pass-through"
            }
        );
        let argv = commands::assemble_argv(job, use_mixer);
        self.run_single(Stage::Assemble, argv, 0)?;
        Ok(())
    }
}
