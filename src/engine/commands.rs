// Argv construction for every external command. The flag groups are fixed;
// stages compose them with per-group paths and the rendered filter chain.

use std::io::Write;
use std::path::{Path, PathBuf};

use super::filters;
use super::planner::{Job, ProbeBounds};
use super::registry::StageParams;

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

/// Global options opening every encoder invocation.
const START: &[&str] = &["-hide_banner", "-loglevel", "level+info", "-y"];

/// Options preceding every input.
const INPUT_INIT: &[&str] = &[
    "-loglevel",
    "level+warning",
    "-nostats",
    "-colorspace",
    "bt709",
    "-color_range",
    "pc",
];

/// Extra input options when the input is a concat list.
const CONCAT_INPUT: &[&str] = &["-f", "concat", "-safe", "0"];

/// Output format group for encoded outputs.
const FORMAT: &[&str] = &[
    "-colorspace",
    "bt709",
    "-color_range",
    "pc",
    "-pix_fmt",
    "yuv444p",
    "-f",
    "matroska",
    "-write_crc32",
    "0",
];

/// Intermediate codec: lossless, fast to decode again.
const INTERP_CODEC: &[&str] = &["-codec:v", "utvideo", "-pred", "median"];

/// Final delivery codec.
const FINAL_CODEC: &[&str] = &[
    "-codec:v",
    "h264_nvenc",
    "-preset:v",
    "p7",
    "-tune:v",
    "hq",
    "-profile:v",
    "high444p",
    "-level:v",
    "5.2",
    "-rc:v",
    "vbr",
    "-rgb_mode",
    "yuv444",
    "-cq",
    "4",
    "-qmin",
    "1",
    "-qmax",
    "16",
    "-temporal_aq",
    "1",
    "-b_adapt",
    "0",
    "-b_ref_mode",
    "0",
    "-zerolatency",
    "1",
    "-multipass",
    "2",
    "-forced-idr",
    "1",
];

fn push_group(argv: &mut Vec<String>, group: &[&str]) {
    argv.extend(group.iter().map(|s| s.to_string()));
}

fn push(argv: &mut Vec<String>, arg: impl Into<String>) {
    argv.push(arg.into());
}

fn push_path(argv: &mut Vec<String>, path: &Path) {
    argv.push(path.to_string_lossy().into_owned());
}

/// Probe argv. The optional bounds come from the first pass and keep the
/// re-probe from reading the whole file.
pub fn probe_argv(input: &Path, bounds: Option<&ProbeBounds>) -> Vec<String> {
    let mut argv = vec![FFPROBE.to_string()];
    push_group(&mut argv, &["-hide_banner", "-loglevel", "error"]);
    if let Some(bounds) = bounds {
        push(&mut argv, "-probesize");
        push(&mut argv, bounds.probesize.to_string());
        push(&mut argv, "-analyzeduration");
        push(&mut argv, bounds.analyzeduration_us.to_string());
        push(&mut argv, "-fpsprobesize");
        push(&mut argv, bounds.fpsprobesize.to_string());
    }
    push_group(
        &mut argv,
        &["-show_format", "-show_streams", "-print_format", "flat=s=_"],
    );
    push_path(&mut argv, input);
    argv
}

/// Concatenate a group's sources (listed in `lst`) into `cat`, stream-copy.
pub fn concat_argv(lst: &Path, cat: &Path) -> Vec<String> {
    let mut argv = vec![FFMPEG.to_string()];
    push_group(&mut argv, START);
    push_group(&mut argv, INPUT_INIT);
    push_group(&mut argv, CONCAT_INPUT);
    push(&mut argv, "-i");
    push_path(&mut argv, lst);
    push_group(&mut argv, &["-codec", "copy", "-f", "matroska"]);
    push_path(&mut argv, cat);
    argv
}

/// Split `cat` into four equal-duration stream-copied segments.
pub fn segment_argv(cat: &Path, segment_time_s: u64, pattern: &Path) -> Vec<String> {
    let mut argv = vec![FFMPEG.to_string()];
    push_group(&mut argv, START);
    push_group(&mut argv, INPUT_INIT);
    push(&mut argv, "-i");
    push_path(&mut argv, cat);
    push_group(&mut argv, &["-codec", "copy", "-f", "segment", "-segment_time"]);
    push(&mut argv, segment_time_s.to_string());
    push_path(&mut argv, pattern);
    argv
}

/// One interpolation worker: source slot in, filtered video out, progress
/// file for the watchdog. Rebuilt verbatim (with the alt flag toggled) on
/// freeze recovery.
pub fn interp_argv(
    source: &Path,
    target: &Path,
    progress: &Path,
    params: &StageParams,
) -> Vec<String> {
    let mut argv = vec![FFMPEG.to_string()];
    push_group(&mut argv, START);
    push(&mut argv, "-progress");
    push_path(&mut argv, progress);
    push_group(&mut argv, INPUT_INIT);
    push(&mut argv, "-i");
    push_path(&mut argv, source);

    let chain = filters::interp_chain(params);
    push(&mut argv, "-filter_complex");
    push(&mut argv, chain.render());
    push(&mut argv, "-map");
    push(&mut argv, chain.output_pad());

    push_group(&mut argv, INTERP_CODEC);
    push_group(&mut argv, FORMAT);
    push_path(&mut argv, target);
    argv
}

/// Audio track layout for the final output, derived from the main audio
/// stream's channel count.
fn push_assemble_audio(argv: &mut Vec<String>, main_channels: Option<u32>) {
    let Some(channels) = main_channels else {
        return;
    };
    if channels > 2 {
        // Track 0: 5.1 surround, track 1: stereo downmix.
        push_group(argv, &["-map", "1:a:0", "-codec:a:0", "pcm_s24le", "-ac:a:0", "6"]);
        push_group(argv, &["-metadata:s:a:0", "title=Surround"]);
        push_group(argv, &["-map", "1:a:0", "-codec:a:1", "pcm_s24le", "-ac:a:1", "2"]);
        push_group(argv, &["-metadata:s:a:1", "title=Stereo"]);
    } else {
        push_group(argv, &["-map", "1:a:0", "-codec:a:0", "pcm_s24le", "-ac:a:0", "2"]);
        push_group(argv, &["-metadata:s:a:0", "title=Stereo"]);
    }
}

/// Final assembly: concat the down-interpolated slots, enforce CFR, encode
/// with the delivery codec, lay out the audio tracks, and optionally split
/// the voice stream into a sibling `.wav`.
pub fn assemble_argv(job: &Job, use_mixer: bool) -> Vec<String> {
    let main_channels = job
        .sources
        .iter()
        .find_map(|s| s.main_audio_channels());
    let split_voice = job.split_voice && job.has_voice_stream();

    let mut argv = vec![FFMPEG.to_string()];
    push_group(&mut argv, START);

    // Input 0: the interpolated video slots.
    push_group(&mut argv, INPUT_INIT);
    push_group(&mut argv, CONCAT_INPUT);
    push(&mut argv, "-i");
    push_path(&mut argv, &job.assembly_list);

    // Input 1: the concatenation results, for audio.
    push_group(&mut argv, INPUT_INIT);
    if main_channels.is_some() {
        // Layout is known; never let the demuxer guess one.
        push_group(&mut argv, &["-guess_layout_max", "0"]);
    }
    push_group(&mut argv, CONCAT_INPUT);
    push(&mut argv, "-i");
    push_path(&mut argv, &job.audio_list);

    let chain = filters::assemble_chain(job.target_fps, use_mixer);
    push(&mut argv, "-filter_complex");
    push(&mut argv, chain.render());
    push(&mut argv, "-map");
    push(&mut argv, chain.output_pad());

    push_group(&mut argv, FINAL_CODEC);
    push_assemble_audio(&mut argv, main_channels);
    push_group(&mut argv, FORMAT);
    push_path(&mut argv, &job.output_path);

    if split_voice {
        // Second output: the voice stream, mono upgraded to stereo PCM.
        push_group(&mut argv, &["-map", "1:a:1", "-codec:a", "pcm_s24le", "-ac", "2"]);
        push_group(&mut argv, &["-f", "wav"]);
        push_path(&mut argv, &job.voice_wav_path());
    }
    argv
}

/// Write a concat-demuxer list file: one `file '<path>'` line per entry.
pub fn write_list(paths: &[PathBuf], lst: &Path) -> std::io::Result<()> {
    let mut file = std::fs::File::create(lst)?;
    for path in paths {
        let escaped = path.to_string_lossy().replace('\'', r"'\''");
        writeln!(file, "file '{escaped}'")?;
    }
    Ok(())
}
