// Pipeline driver: plan the job, then walk every group through
// concat → segment → interp-up → interp-down, write the assembly lists and
// run the final encode. All stage machinery lives in the engine.

use std::process::{Command, Stdio};

use crate::cli::Cli;
use crate::engine::planner::{self, Job, PlanRequest, ProbeBounds};
use crate::engine::registry::InterpPass;
use crate::engine::{CleanupPolicy, Orchestrator, Registry, probe};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::{log_debug, log_info, log_status, logging};

/// Every external tool the pipeline shells out to.
const REQUIRED_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

fn check_tools() -> PipelineResult<()> {
    for tool in REQUIRED_TOOLS {
        let found = Command::new(tool)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok();
        if !found {
            return Err(PipelineError::MissingTool(tool.to_string()));
        }
    }
    Ok(())
}

/// Probe every input twice: once unbounded for duration and rate, then
/// re-probe with limits derived from the first pass.
fn probe_sources(
    orchestrator: &mut Orchestrator,
    req: &PlanRequest,
) -> PipelineResult<Vec<probe::SourceInfo>> {
    let mut sources = Vec::with_capacity(req.inputs.len());
    for input in &req.inputs {
        let first_output = orchestrator.probe(input, None)?;
        let first = probe::parse_probe_output(input, &first_output).map_err(|e| {
            PipelineError::StageFailed {
                stage: Stage::Probe,
                msg: e.to_string(),
            }
        })?;

        let bounds = ProbeBounds::from_first_pass(&first);
        log_debug!(
            "re-probing {} with probesize={} analyzeduration={} fpsprobesize={}",
            input.display(),
            bounds.probesize,
            bounds.analyzeduration_us,
            bounds.fpsprobesize
        );
        let second_output = orchestrator.probe(input, Some(&bounds))?;
        let info = probe::parse_probe_output(input, &second_output).map_err(|e| {
            PipelineError::StageFailed {
                stage: Stage::Probe,
                msg: e.to_string(),
            }
        })?;

        log_info!(
            "{}: {:.1} s, {} fps avg, {} streams",
            input.display(),
            info.duration_s,
            info.avg_fps,
            info.stream_count
        );
        sources.push(info);
    }
    Ok(sources)
}

fn run_stages(orchestrator: &mut Orchestrator, job: &mut Job) -> PipelineResult<()> {
    for index in 0..job.groups.len() {
        let group = job.groups[index].clone();
        if group.needs_concat() {
            orchestrator.concat(job, &group)?;
        } else {
            log_debug!(
                "group {}: single source, concatenation skipped",
                group.id
            );
        }
        orchestrator.segment(&group)?;

        let dropdups = orchestrator.interp(job, &group, InterpPass::Up)?;
        job.groups[index].dropdups += dropdups;

        let dropdups = orchestrator.interp(job, &group, InterpPass::Down)?;
        job.groups[index].dropdups += dropdups;

        log_debug!(
            "group {}: {} drop/dup frames observed",
            group.id,
            job.groups[index].dropdups
        );
    }

    orchestrator.write_assembly_lists(job)?;
    orchestrator.assemble(job)
}

pub fn run(cli: Cli) -> PipelineResult<()> {
    let req = PlanRequest {
        inputs: cli.inputs,
        output: cli.output,
        temp_dir: cli.tempdir,
        split_voice: cli.splitaudio,
        force_upgrade: cli.upgrade,
        user_max_fps: cli.maxfps,
        user_target_fps: cli.targetfps,
    };
    planner::validate_request(&req)?;

    let log_path = logging::init(&req.output, cli.debug)
        .map_err(|e| PipelineError::Usage(e.to_string()))?;
    log_status!(
        "processing {} input(s) into {}",
        req.inputs.len(),
        req.output.display()
    );
    log_debug!("log file: {}", log_path.display());

    check_tools()?;

    let registry = Registry::new();
    registry.set_lock_debug(cli.lock_debug);
    let mut orchestrator = Orchestrator::new(registry);

    let sources = probe_sources(&mut orchestrator, &req)?;
    let mut job = planner::build_job(
        &req,
        sources,
        std::process::id(),
        planner::system_free_space,
    )?;
    log_info!(
        "{} group(s); target {} fps, ceiling {} fps",
        job.groups.len(),
        job.target_fps,
        job.max_fps
    );

    let policy = CleanupPolicy::new(cli.debug);
    let result = run_stages(&mut orchestrator, &mut job);
    if result.is_err() {
        orchestrator.shutdown();
    }
    policy.dispose_job(&job);

    if result.is_ok() {
        log_status!("wrote {}", job.output_path.display());
        if job.split_voice && job.has_voice_stream() {
            log_status!("wrote {}", job.voice_wav_path().display());
        }
    }
    result
}
