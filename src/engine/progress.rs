// Parser for the encoder's progress file (key=value blocks, one frame per
// `progress=` line). The file is appended to while we read it, so only the
// tail is examined and partial last lines are ignored.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// How much of the file tail is inspected per tick. Generous for ~20 lines
/// of short key=value pairs.
const TAIL_BYTES: u64 = 4096;

/// How many complete lines of the tail are scanned backwards.
const TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressState {
    /// No `progress=` line seen yet.
    #[default]
    None,
    /// The encoder reported a frame and keeps going.
    Continue,
    /// The encoder wrote `progress=end`.
    Ended,
}

/// One decoded progress frame, or the aggregate of several.
#[derive(Debug, Clone, Default)]
pub struct ProgressFrame {
    pub bitrate_bps: u64,
    pub dup_frames: u64,
    pub drop_frames: u64,
    pub fps: f64,
    pub frame: u64,
    pub out_time_us: u64,
    pub total_size: u64,
    pub state: ProgressState,
}

impl ProgressFrame {
    /// Fold another worker's frame into this aggregate.
    pub fn accumulate(&mut self, other: &ProgressFrame) {
        self.bitrate_bps += other.bitrate_bps;
        self.dup_frames += other.dup_frames;
        self.drop_frames += other.drop_frames;
        self.fps += other.fps;
        self.frame += other.frame;
        self.out_time_us += other.out_time_us;
        self.total_size += other.total_size;
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bitrate" => {
                // "1234.5kbits/s", or "N/A" early on.
                let trimmed = value.trim().trim_end_matches("kbits/s");
                if let Ok(kbps) = trimmed.parse::<f64>() {
                    self.bitrate_bps = (kbps * 1000.0).max(0.0) as u64;
                }
            }
            "dup_frames" => {
                if let Ok(v) = value.trim().parse() {
                    self.dup_frames = v;
                }
            }
            "drop_frames" => {
                if let Ok(v) = value.trim().parse() {
                    self.drop_frames = v;
                }
            }
            "fps" => {
                if let Ok(v) = value.trim().parse() {
                    self.fps = v;
                }
            }
            "frame" => {
                if let Ok(v) = value.trim().parse() {
                    self.frame = v;
                }
            }
            // out_time_ms is microseconds despite the name; both spellings
            // appear depending on the encoder build.
            "out_time_ms" | "out_time_us" => {
                if let Ok(v) = value.trim().parse() {
                    self.out_time_us = v;
                }
            }
            "total_size" => {
                if let Ok(v) = value.trim().parse() {
                    self.total_size = v;
                }
            }
            _ => {}
        }
    }
}

/// Read the tail of a progress file. Returns None when the file does not
/// exist yet (the child has not opened it).
pub fn read_tail(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Decode the most recent frame from a progress-file tail.
///
/// The newest `progress=<state>` line wins. For `continue`, the field lines
/// above it (up to the previous `progress=` line) form the current frame.
/// A trailing line without a newline is a partial write and is dropped.
pub fn parse_latest_frame(tail: &str) -> ProgressFrame {
    let mut frame = ProgressFrame::default();

    let complete = match tail.rfind('\n') {
        Some(pos) => &tail[..pos],
        None => return frame,
    };
    let lines: Vec<&str> = complete.lines().rev().take(TAIL_LINES).collect();

    let Some(newest) = lines.iter().position(|l| l.starts_with("progress=")) else {
        return frame;
    };

    let state_value = lines[newest].split_once('=').map(|(_, v)| v.trim());
    frame.state = match state_value {
        Some("end") => ProgressState::Ended,
        Some(_) => ProgressState::Continue,
        None => ProgressState::None,
    };
    if frame.state == ProgressState::Ended {
        return frame;
    }

    for line in &lines[newest + 1..] {
        if line.starts_with("progress=") {
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            frame.apply(key.trim(), value);
        }
    }
    frame
}

/// Format microseconds as `HH:MM:SS.uuuuuu`.
pub fn format_out_time(us: u64) -> String {
    let secs = us / 1_000_000;
    let micros = us % 1_000_000;
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        micros
    )
}

/// Render the one-line console indicator for an aggregate frame.
pub fn render_progress_line(active: usize, total: usize, agg: &ProgressFrame) -> String {
    if agg.frame > 0 {
        format!(
            "[{}/{} running] Frame {} ({} drp, {} dup); {}; FPS {:.2}; rate {} bits/s; Size {}",
            active,
            total,
            agg.frame,
            agg.drop_frames,
            agg.dup_frames,
            format_out_time(agg.out_time_us),
            agg.fps,
            agg.bitrate_bps,
            agg.total_size
        )
    } else {
        format!(
            "[{}/{} running] {}",
            active,
            total,
            format_out_time(agg.out_time_us)
        )
    }
}
