// Parsing of the probe tool's flat key=value output
// (`-print_format flat=s=_`): `format_<field>=...` for the container,
// `streams_stream_<n>_<field>=...` per stream.

use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Probe-derived attributes of one input file. Immutable once built.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub directory: PathBuf,
    pub duration_s: f64,
    pub avg_fps: u32,
    pub bitrate_bps: u64,
    pub stream_count: usize,
    /// codec_name per stream index (empty string when the probe omitted it).
    pub codecs: Vec<String>,
    /// channels per stream index (0 for non-audio streams).
    pub channels: Vec<u32>,
    pub video_stream: usize,
    /// Audio stream indices in probe order: main first, voice second.
    pub audio_streams: Vec<usize>,
}

impl SourceInfo {
    pub fn main_audio_channels(&self) -> Option<u32> {
        self.audio_streams.first().map(|&idx| self.channels[idx])
    }

    pub fn has_voice_stream(&self) -> bool {
        self.audio_streams.len() > 1
    }
}

/// An average frame rate, floored to whole frames: `48000/1001` is 47,
/// `60/1` and `60` are 60.
pub fn parse_avg_fps(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some((num, den)) = s.split_once('/') {
        let num: u64 = num.trim().parse().ok()?;
        let den: u64 = den.trim().parse().ok()?;
        if den == 0 {
            return None;
        }
        Some((num / den) as u32)
    } else {
        s.parse::<u32>().ok()
    }
}

fn strip_quotes(value: &str) -> &str {
    value.trim().trim_matches('"')
}

/// Split flat probe output into the format map and per-stream field maps.
fn collect_fields(
    text: &str,
) -> (HashMap<String, String>, HashMap<usize, HashMap<String, String>>) {
    let mut format = HashMap::new();
    let mut streams: HashMap<usize, HashMap<String, String>> = HashMap::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = strip_quotes(value).to_string();

        if let Some(rest) = key.strip_prefix("streams_stream_") {
            let Some((index, field)) = rest.split_once('_') else {
                continue;
            };
            if let Ok(index) = index.parse::<usize>() {
                streams
                    .entry(index)
                    .or_default()
                    .insert(field.to_string(), value);
            }
        } else if let Some(field) = key.strip_prefix("format_") {
            format.insert(field.to_string(), value);
        }
    }
    (format, streams)
}

/// Build a SourceInfo from the probe output for `path`.
///
/// Hard errors: no video stream, a third audio stream, or an unparseable
/// duration / frame rate.
pub fn parse_probe_output(path: &Path, text: &str) -> Result<SourceInfo> {
    let (format, streams) = collect_fields(text);

    let stream_count = format
        .get("nb_streams")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(streams.len());

    let duration_s: f64 = format
        .get("duration")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unparseable duration for {}", path.display()))?;

    let bitrate_bps: u64 = format
        .get("bit_rate")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut codecs = vec![String::new(); stream_count];
    let mut channels = vec![0u32; stream_count];
    let mut video_stream = None;
    let mut audio_streams = Vec::new();
    let mut avg_fps = None;

    let mut indices: Vec<usize> = streams.keys().copied().collect();
    indices.sort_unstable();

    for index in indices {
        let fields = &streams[&index];
        if index >= codecs.len() {
            codecs.resize(index + 1, String::new());
            channels.resize(index + 1, 0);
        }
        if let Some(name) = fields.get("codec_name") {
            codecs[index] = name.clone();
        }
        match fields.get("codec_type").map(String::as_str) {
            Some("video") => {
                if video_stream.is_none() {
                    video_stream = Some(index);
                    avg_fps = fields.get("avg_frame_rate").and_then(|v| parse_avg_fps(v));
                }
            }
            Some("audio") => {
                channels[index] = fields
                    .get("channels")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                audio_streams.push(index);
            }
            _ => {}
        }
    }

    let video_stream =
        video_stream.ok_or_else(|| anyhow!("no video stream in {}", path.display()))?;
    if audio_streams.len() > 2 {
        bail!(
            "{} has {} audio streams; at most main + voice are supported",
            path.display(),
            audio_streams.len()
        );
    }
    let avg_fps =
        avg_fps.ok_or_else(|| anyhow!("unparseable average fps for {}", path.display()))?;

    let directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(SourceInfo {
        path: path.to_path_buf(),
        directory,
        duration_s,
        avg_fps,
        bitrate_bps,
        stream_count,
        codecs,
        channels,
        video_stream,
        audio_streams,
    })
}
