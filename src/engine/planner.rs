// Job planning: input validation, source grouping, fps determination,
// disk-space budget, and the temp-file name templates every stage uses.

use std::path::{Path, PathBuf};

use super::probe::SourceInfo;
use crate::error::{PipelineError, PipelineResult};
use crate::log_debug;

/// Workers per interpolation stage; also the segment count.
pub const SLOTS: usize = 4;

/// Caps for the bounded second probe pass.
const PROBESIZE_CAP: u64 = 256 * 1024 * 1024;
const ANALYZE_CAP_US: u64 = 30_000_000;
const FPSPROBE_CAP: u32 = 8 * 120;

/// Disk-budget size factors: 100x of the input size at low bitrates tapering
/// to 20x at high ones.
const FACTOR_LOW_MBPS: f64 = 45.0;
const FACTOR_HIGH_MBPS: f64 = 180.0;
const FACTOR_AT_LOW: f64 = 100.0;
const FACTOR_AT_HIGH: f64 = 20.0;

/// Limits for the re-probe derived from the first probe pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeBounds {
    pub probesize: u64,
    pub analyzeduration_us: u64,
    pub fpsprobesize: u32,
}

impl ProbeBounds {
    /// Derive bounded probe limits: enough bytes for 30 s at the observed
    /// bitrate, the observed duration, and 8x the observed fps, each capped.
    pub fn from_first_pass(info: &SourceInfo) -> ProbeBounds {
        let bytes_for_30s = (info.bitrate_bps / 8).saturating_mul(30).max(1 << 20);
        let duration_us = (info.duration_s * 1_000_000.0).max(1_000_000.0) as u64;
        ProbeBounds {
            probesize: bytes_for_30s.min(PROBESIZE_CAP),
            analyzeduration_us: duration_us.min(ANALYZE_CAP_US),
            fpsprobesize: (info.avg_fps.saturating_mul(8)).clamp(8, FPSPROBE_CAP),
        }
    }
}

/// Derived file names for one source group. Pure in
/// `(directory, main_pid, gid)`; the slot index selects within the arrays.
#[derive(Debug, Clone)]
pub struct GroupTemplates {
    pub cat: PathBuf,
    pub lst: PathBuf,
    /// Segment-muxer pattern (`%d` expands to the slot).
    pub tmp_pattern: PathBuf,
    pub tmp: [PathBuf; SLOTS],
    pub iup: [PathBuf; SLOTS],
    pub idn: [PathBuf; SLOTS],
    pub prgu: [PathBuf; SLOTS],
    pub prgd: [PathBuf; SLOTS],
}

/// Expand the template set for a group. The main process id makes every
/// name globally unique; two runs never collide.
pub fn templates_for(dir: &Path, main_pid: u32, gid: u32) -> GroupTemplates {
    let prefix = format!("reframe_{main_pid}_g{gid}");
    let name = |suffix: String| dir.join(format!("{prefix}_{suffix}"));
    GroupTemplates {
        cat: name("cat.mkv".into()),
        lst: name("cat.lst".into()),
        tmp_pattern: name("seg_%d.mkv".into()),
        tmp: std::array::from_fn(|i| name(format!("seg_{i}.mkv"))),
        iup: std::array::from_fn(|i| name(format!("iup_{i}.mkv"))),
        idn: std::array::from_fn(|i| name(format!("idn_{i}.mkv"))),
        prgu: std::array::from_fn(|i| name(format!("up_{i}.prg"))),
        prgd: std::array::from_fn(|i| name(format!("dn_{i}.prg"))),
    }
}

/// A contiguous run of sources sharing codec layout, channel counts and
/// (without a global temp dir) directory. The unit of segmentation.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub id: u32,
    pub directory: PathBuf,
    pub total_duration_s: f64,
    pub max_fps: u32,
    pub source_ids: Vec<usize>,
    pub templates: GroupTemplates,
    /// The concatenation result: the single source itself when the group
    /// has one member, the `cat` template otherwise.
    pub cat_path: PathBuf,
    /// Drop+dup frames observed across this group's interpolation stages.
    /// Written once per stage, never decreasing.
    pub dropdups: u64,
}

impl SourceGroup {
    pub fn needs_concat(&self) -> bool {
        self.source_ids.len() > 1
    }

    /// Segment length in seconds: total duration split four ways, rounded
    /// up so the last segment is never starved.
    pub fn segment_time_s(&self) -> u64 {
        (1.0 + self.total_duration_s / SLOTS as f64) as u64
    }
}

/// The fps pair the pipeline works towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsPlan {
    pub target_fps: u32,
    pub max_fps: u32,
}

/// Target defaults to 60 for high-rate sources (or a forced upgrade), else
/// 30. Max defaults to twice the target but never below the fastest
/// source. `--maxfps` can only raise the max; `--targetfps` overrides the
/// target but is clamped to the max. Values below 1 are ignored.
pub fn plan_fps(
    source_max_fps: u32,
    force_upgrade: bool,
    user_max_fps: Option<u32>,
    user_target_fps: Option<u32>,
) -> FpsPlan {
    let default_target = if source_max_fps >= 50 || force_upgrade {
        60
    } else {
        30
    };
    let mut max_fps = (2 * default_target).max(source_max_fps);

    if let Some(user_max) = user_max_fps {
        if user_max < 1 {
            log_debug!("ignoring --maxfps {user_max}");
        } else if user_max > max_fps {
            max_fps = user_max;
        }
    }

    let mut target_fps = default_target;
    if let Some(user_target) = user_target_fps {
        if user_target < 1 {
            log_debug!("ignoring --targetfps {user_target}");
        } else {
            target_fps = user_target.min(max_fps);
        }
    }

    FpsPlan {
        target_fps,
        max_fps,
    }
}

/// Size factor for the free-space budget, linear between the endpoints.
pub fn size_factor(bitrate_bps: u64) -> f64 {
    let mbps = bitrate_bps as f64 / 1_000_000.0;
    if mbps <= FACTOR_LOW_MBPS {
        FACTOR_AT_LOW
    } else if mbps >= FACTOR_HIGH_MBPS {
        FACTOR_AT_HIGH
    } else {
        let span = FACTOR_HIGH_MBPS - FACTOR_LOW_MBPS;
        FACTOR_AT_LOW - (mbps - FACTOR_LOW_MBPS) * (FACTOR_AT_LOW - FACTOR_AT_HIGH) / span
    }
}

/// The validated, immutable job description the whole pipeline runs from.
#[derive(Debug, Clone)]
pub struct Job {
    pub output_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub split_voice: bool,
    pub sources: Vec<SourceInfo>,
    pub groups: Vec<SourceGroup>,
    pub target_fps: u32,
    pub max_fps: u32,
    /// Job-level list of every group's down-interpolated slots, consumed by
    /// the assemble stage.
    pub assembly_list: PathBuf,
    /// Job-level list of every group's concatenation result; the assemble
    /// stage reads its audio from here.
    pub audio_list: PathBuf,
    pub main_pid: u32,
}

impl Job {
    /// The voice `.wav` sibling of the output.
    pub fn voice_wav_path(&self) -> PathBuf {
        self.output_path.with_extension("wav")
    }

    pub fn job_dropdups(&self) -> u64 {
        self.groups.iter().map(|g| g.dropdups).sum()
    }

    /// True when any source carries a second audio stream.
    pub fn has_voice_stream(&self) -> bool {
        self.sources.iter().any(|s| s.has_voice_stream())
    }
}

/// Everything the CLI hands the planner.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub split_voice: bool,
    pub force_upgrade: bool,
    pub user_max_fps: Option<u32>,
    pub user_target_fps: Option<u32>,
}

/// Pre-probe validation: inputs exist and are non-empty, the output is a
/// fresh `.mkv`, and no input doubles as the output.
pub fn validate_request(req: &PlanRequest) -> PipelineResult<()> {
    if req.inputs.is_empty() {
        return Err(PipelineError::Usage("at least one input is required".into()));
    }
    for input in &req.inputs {
        let meta = std::fs::metadata(input).map_err(|_| {
            PipelineError::Usage(format!("input does not exist: {}", input.display()))
        })?;
        if meta.len() == 0 {
            return Err(PipelineError::Usage(format!(
                "input is empty: {}",
                input.display()
            )));
        }
        if input == &req.output {
            return Err(PipelineError::Usage(format!(
                "input and output are the same file: {}",
                input.display()
            )));
        }
    }
    if req.output.extension().and_then(|e| e.to_str()) != Some("mkv") {
        return Err(PipelineError::Usage(format!(
            "output must end in .mkv: {}",
            req.output.display()
        )));
    }
    if req.output.exists() {
        return Err(PipelineError::Usage(format!(
            "output already exists: {}",
            req.output.display()
        )));
    }
    if let Some(dir) = &req.temp_dir {
        if !dir.is_dir() {
            return Err(PipelineError::Usage(format!(
                "temp dir does not exist: {}",
                dir.display()
            )));
        }
    }
    Ok(())
}

/// Group key per source: the fields whose change starts a new group.
fn group_key<'a>(source: &'a SourceInfo, temp_dir: Option<&Path>) -> (Option<&'a Path>, usize, &'a [String], &'a [u32]) {
    // With a global temp dir all work lands in one place, so the source
    // directory stops mattering for grouping.
    let dir = if temp_dir.is_some() {
        None
    } else {
        Some(source.directory.as_path())
    };
    (dir, source.stream_count, &source.codecs, &source.channels)
}

/// Partition sources into contiguous groups and expand their templates.
pub fn group_sources(
    sources: &[SourceInfo],
    temp_dir: Option<&Path>,
    main_pid: u32,
) -> Vec<SourceGroup> {
    let mut groups: Vec<SourceGroup> = Vec::new();

    for (idx, source) in sources.iter().enumerate() {
        let start_new = match groups.last() {
            None => true,
            Some(group) => {
                let prev = &sources[*group.source_ids.last().expect("non-empty group")];
                group_key(prev, temp_dir) != group_key(source, temp_dir)
            }
        };

        if start_new {
            let gid = groups.len() as u32;
            let directory = temp_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source.directory.clone());
            let templates = templates_for(&directory, main_pid, gid);
            let cat_path = templates.cat.clone();
            groups.push(SourceGroup {
                id: gid,
                directory,
                total_duration_s: 0.0,
                max_fps: 0,
                source_ids: Vec::new(),
                templates,
                cat_path,
                dropdups: 0,
            });
        }

        let group = groups.last_mut().expect("just pushed");
        group.source_ids.push(idx);
        group.total_duration_s += source.duration_s;
        group.max_fps = group.max_fps.max(source.avg_fps);
    }

    // A single-member group skips concatenation entirely.
    for group in &mut groups {
        if !group.needs_concat() {
            group.cat_path = sources[group.source_ids[0]].path.clone();
        }
    }
    groups
}

/// Check the per-directory space budget. `free_space` answers "available
/// bytes for this directory" so tests can substitute the disk query.
pub fn check_space(
    sources: &[SourceInfo],
    temp_dir: Option<&Path>,
    free_space: impl Fn(&Path) -> Option<u64>,
) -> PipelineResult<()> {
    use std::collections::HashMap;

    let mut needed: HashMap<PathBuf, u64> = HashMap::new();
    for source in sources {
        let dir = temp_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| source.directory.clone());
        let size = std::fs::metadata(&source.path).map(|m| m.len()).unwrap_or(0);
        let want = (size as f64 * size_factor(source.bitrate_bps)) as u64;
        *needed.entry(dir).or_insert(0) += want;
    }

    for (dir, want) in needed {
        let Some(avail) = free_space(&dir) else {
            return Err(PipelineError::Usage(format!(
                "cannot determine free space for {}",
                dir.display()
            )));
        };
        log_debug!(
            "space budget for {}: need {want} bytes, {avail} available",
            dir.display()
        );
        if want > avail {
            return Err(PipelineError::Usage(format!(
                "not enough space in {}: need {want} bytes, only {avail} available",
                dir.display()
            )));
        }
    }
    Ok(())
}

/// Free space via the system disk list: the disk with the longest mount
/// point that prefixes the directory wins.
pub fn system_free_space(dir: &Path) -> Option<u64> {
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Assemble the full Job from probed sources.
pub fn build_job(
    req: &PlanRequest,
    sources: Vec<SourceInfo>,
    main_pid: u32,
    free_space: impl Fn(&Path) -> Option<u64>,
) -> PipelineResult<Job> {
    check_space(&sources, req.temp_dir.as_deref(), free_space)?;

    let groups = group_sources(&sources, req.temp_dir.as_deref(), main_pid);
    let source_max = sources.iter().map(|s| s.avg_fps).max().unwrap_or(0);
    let fps = plan_fps(
        source_max,
        req.force_upgrade,
        req.user_max_fps,
        req.user_target_fps,
    );

    let list_dir = groups
        .first()
        .map(|g| g.directory.clone())
        .ok_or_else(|| PipelineError::Usage("no sources to plan".into()))?;

    Ok(Job {
        output_path: req.output.clone(),
        temp_dir: req.temp_dir.clone(),
        split_voice: req.split_voice,
        sources,
        groups,
        target_fps: fps.target_fps,
        max_fps: fps.max_fps,
        assembly_list: list_dir.join(format!("reframe_{main_pid}_all.lst")),
        audio_list: list_dir.join(format!("reframe_{main_pid}_audio.lst")),
        main_pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &str, fps: u32, duration: f64, codecs: &[&str], channels: &[u32]) -> SourceInfo {
        SourceInfo {
            path: PathBuf::from(dir).join("in.mkv"),
            directory: PathBuf::from(dir),
            duration_s: duration,
            avg_fps: fps,
            bitrate_bps: 50_000_000,
            stream_count: codecs.len(),
            codecs: codecs.iter().map(|s| s.to_string()).collect(),
            channels: channels.to_vec(),
            video_stream: 0,
            audio_streams: (1..codecs.len()).collect(),
        }
    }

    #[test]
    fn test_fps_defaults() {
        // High-rate source upgrades to 60.
        assert_eq!(
            plan_fps(60, false, None, None),
            FpsPlan { target_fps: 60, max_fps: 120 }
        );
        // Slow source stays at 30 unless upgraded.
        assert_eq!(
            plan_fps(30, false, None, None),
            FpsPlan { target_fps: 30, max_fps: 60 }
        );
        assert_eq!(
            plan_fps(30, true, None, None),
            FpsPlan { target_fps: 60, max_fps: 120 }
        );
        // 50 fps is already "high rate".
        assert_eq!(plan_fps(50, false, None, None).target_fps, 60);
    }

    #[test]
    fn test_fps_max_never_below_source() {
        let plan = plan_fps(144, false, None, None);
        assert_eq!(plan.target_fps, 60);
        assert_eq!(plan.max_fps, 144);
    }

    #[test]
    fn test_fps_user_overrides() {
        // --maxfps can only raise.
        assert_eq!(plan_fps(60, false, Some(100), None).max_fps, 120);
        assert_eq!(plan_fps(60, false, Some(240), None).max_fps, 240);
        // --targetfps is clamped to max.
        assert_eq!(plan_fps(60, false, None, Some(144)).target_fps, 120);
        assert_eq!(plan_fps(60, false, None, Some(48)).target_fps, 48);
        // Sub-1 values are ignored.
        assert_eq!(plan_fps(60, false, Some(0), Some(0)).target_fps, 60);
        assert_eq!(plan_fps(60, false, Some(0), Some(0)).max_fps, 120);
    }

    #[test]
    fn test_probe_bounds_caps() {
        let mut info = source("/a", 60, 60.0, &["h264"], &[0]);
        info.bitrate_bps = 1_000_000_000; // 1 Gbit/s: 30 s worth overflows the cap
        info.duration_s = 4000.0;
        info.avg_fps = 480;
        let bounds = ProbeBounds::from_first_pass(&info);
        assert_eq!(bounds.probesize, 256 * 1024 * 1024);
        assert_eq!(bounds.analyzeduration_us, 30_000_000);
        assert_eq!(bounds.fpsprobesize, 960);

        info.bitrate_bps = 8_000_000;
        info.duration_s = 10.0;
        info.avg_fps = 60;
        let bounds = ProbeBounds::from_first_pass(&info);
        assert_eq!(bounds.probesize, 30_000_000);
        assert_eq!(bounds.analyzeduration_us, 10_000_000);
        assert_eq!(bounds.fpsprobesize, 480);
    }

    #[test]
    fn test_size_factor_interpolation() {
        assert_eq!(size_factor(45_000_000), 100.0);
        assert_eq!(size_factor(10_000_000), 100.0);
        assert_eq!(size_factor(180_000_000), 20.0);
        assert_eq!(size_factor(250_000_000), 20.0);
        let mid = size_factor(112_500_000); // halfway point
        assert!((mid - 60.0).abs() < 1e-9, "got {mid}");
    }

    #[test]
    fn test_grouping_boundaries() {
        let sources = vec![
            source("/a", 60, 10.0, &["h264", "aac"], &[0, 2]),
            source("/a", 60, 10.0, &["h264", "aac"], &[0, 2]),
            source("/a", 60, 10.0, &["h264", "opus"], &[0, 2]), // codec change
            source("/b", 60, 10.0, &["h264", "opus"], &[0, 2]), // directory change
            source("/b", 60, 10.0, &["h264", "opus"], &[0, 6]), // channel change
        ];
        let groups = group_sources(&sources, None, 4242);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].source_ids, vec![0, 1]);
        assert_eq!(groups[1].source_ids, vec![2]);
        assert_eq!(groups[2].source_ids, vec![3]);
        assert_eq!(groups[3].source_ids, vec![4]);
        assert!((groups[0].total_duration_s - 20.0).abs() < 1e-9);

        // A global temp dir erases the directory boundary.
        let groups = group_sources(&sources, Some(Path::new("/tmp")), 4242);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].source_ids, vec![2, 3]);
    }

    #[test]
    fn test_single_source_group_skips_concat() {
        let sources = vec![source("/a", 60, 60.0, &["h264"], &[0])];
        let groups = group_sources(&sources, None, 1);
        assert!(!groups[0].needs_concat());
        assert_eq!(groups[0].cat_path, sources[0].path);

        let many = vec![
            source("/a", 60, 10.0, &["h264"], &[0]),
            source("/a", 60, 10.0, &["h264"], &[0]),
        ];
        let groups = group_sources(&many, None, 1);
        assert!(groups[0].needs_concat());
        assert_eq!(groups[0].cat_path, groups[0].templates.cat);
    }

    #[test]
    fn test_segment_time() {
        let mut group = group_sources(&[source("/a", 60, 60.0, &["h264"], &[0])], None, 1)
            .pop()
            .unwrap();
        assert_eq!(group.segment_time_s(), 16);
        group.total_duration_s = 3.0;
        assert_eq!(group.segment_time_s(), 1);
    }

    #[test]
    fn test_templates_are_pure_and_unique() {
        let a = templates_for(Path::new("/t"), 999, 0);
        let b = templates_for(Path::new("/t"), 999, 0);
        assert_eq!(a.cat, b.cat);
        assert_eq!(a.tmp, b.tmp);
        assert_eq!(a.prgu, b.prgu);

        let other_gid = templates_for(Path::new("/t"), 999, 1);
        let other_pid = templates_for(Path::new("/t"), 1000, 0);
        assert_ne!(a.cat, other_gid.cat);
        assert_ne!(a.cat, other_pid.cat);

        assert_eq!(a.cat, PathBuf::from("/t/reframe_999_g0_cat.mkv"));
        assert_eq!(a.tmp_pattern, PathBuf::from("/t/reframe_999_g0_seg_%d.mkv"));
        assert_eq!(a.tmp[2], PathBuf::from("/t/reframe_999_g0_seg_2.mkv"));
        assert_eq!(a.iup[0], PathBuf::from("/t/reframe_999_g0_iup_0.mkv"));
        assert_eq!(a.idn[3], PathBuf::from("/t/reframe_999_g0_idn_3.mkv"));
        assert_eq!(a.prgd[1], PathBuf::from("/t/reframe_999_g0_dn_1.prg"));
    }

    #[test]
    fn test_validate_request() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mkv");
        std::fs::write(&input, b"data").unwrap();

        let mut req = PlanRequest {
            inputs: vec![input.clone()],
            output: dir.path().join("out.mkv"),
            temp_dir: None,
            split_voice: false,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
        };
        assert!(validate_request(&req).is_ok());

        // Output extension enforced.
        req.output = dir.path().join("out.mp4");
        assert!(matches!(
            validate_request(&req),
            Err(PipelineError::Usage(_))
        ));

        // Existing output refused.
        req.output = dir.path().join("exists.mkv");
        std::fs::write(&req.output, b"x").unwrap();
        assert!(validate_request(&req).is_err());

        // Empty input refused.
        req.output = dir.path().join("out.mkv");
        let empty = dir.path().join("empty.mkv");
        std::fs::write(&empty, b"").unwrap();
        req.inputs = vec![empty];
        assert!(validate_request(&req).is_err());

        // Input doubling as output refused.
        req.inputs = vec![input.clone()];
        req.output = input;
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_check_space_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.mkv");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let mut info = source(dir.path().to_str().unwrap(), 60, 10.0, &["h264"], &[0]);
        info.path = path;
        info.bitrate_bps = 45_000_000; // factor 100 => 100_000 bytes needed

        let sources = vec![info];
        assert!(check_space(&sources, None, |_| Some(200_000)).is_ok());
        let err = check_space(&sources, None, |_| Some(50_000)).unwrap_err();
        assert!(matches!(err, PipelineError::Usage(_)));
        assert!(check_space(&sources, None, |_| None).is_err());
    }

    #[test]
    fn test_build_job_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.mkv");
        std::fs::write(&path, vec![0u8; 10]).unwrap();
        let mut info = source(dir.path().to_str().unwrap(), 60, 60.0, &["h264"], &[0]);
        info.path = path.clone();

        let req = PlanRequest {
            inputs: vec![path],
            output: dir.path().join("out.mkv"),
            temp_dir: None,
            split_voice: true,
            force_upgrade: false,
            user_max_fps: None,
            user_target_fps: None,
        };
        let job = build_job(&req, vec![info], 77, |_| Some(u64::MAX)).unwrap();
        assert_eq!(job.target_fps, 60);
        assert_eq!(job.max_fps, 120);
        assert_eq!(job.groups.len(), 1);
        assert_eq!(
            job.assembly_list,
            dir.path().join("reframe_77_all.lst")
        );
        assert_eq!(job.voice_wav_path(), dir.path().join("out.wav"));
        assert_eq!(job.job_dropdups(), 0);
    }
}
