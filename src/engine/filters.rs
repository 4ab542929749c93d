// Filter-graph construction. Every stage renders its chain exactly once,
// through one labeled builder, so argv never grows filters by string
// concatenation in more than one place.

use super::registry::{InterpPass, StageParams};

/// A linear filter chain with labeled links, rendered to a
/// `-filter_complex` expression: `[0:v]f1[a];[a]f2[b];...`.
#[derive(Debug, Clone)]
pub struct FilterChain {
    input: String,
    links: Vec<(String, String)>,
}

impl FilterChain {
    pub fn from_input(pad: &str) -> Self {
        Self {
            input: pad.to_string(),
            links: Vec::new(),
        }
    }

    pub fn link(mut self, label: &str, filter: impl Into<String>) -> Self {
        self.links.push((label.to_string(), filter.into()));
        self
    }

    /// The label of the last link, as a mappable pad (`[out]`).
    pub fn output_pad(&self) -> String {
        match self.links.last() {
            Some((label, _)) => format!("[{label}]"),
            None => format!("[{}]", self.input),
        }
    }

    pub fn render(&self) -> String {
        let mut rendered = String::new();
        let mut upstream = self.input.clone();
        for (i, (label, filter)) in self.links.iter().enumerate() {
            if i > 0 {
                rendered.push(';');
            }
            rendered.push_str(&format!("[{upstream}]{filter}[{label}]"));
            upstream = label.clone();
        }
        rendered
    }
}

/// Entry scale: even dimensions, full range, accurate rounding.
fn even_full_range_scale() -> String {
    "scale=w=trunc(iw/2)*2:h=trunc(ih/2)*2:in_range=full:out_range=full:\
     flags=accurate_rnd+full_chroma_int+full_chroma_inp"
        .to_string()
}

/// Exit scale: keep full chroma through the output conversion.
fn full_chroma_scale() -> String {
    "scale=in_range=full:out_range=full:\
     flags=accurate_rnd+full_chroma_int+full_chroma_inp"
        .to_string()
}

fn decimate(max: u32, frac: f64) -> String {
    format!("mpdecimate=max={max}:frac={frac}")
}

fn mixer_interpolate(fps: u32) -> String {
    format!("libplacebo=fps={fps}:frame_mixer=mitchell_clamp")
}

fn passthrough_interpolate(fps: u32) -> String {
    format!("libplacebo=fps={fps}:frame_mixer=none")
}

fn classic_up(fps: u32) -> String {
    format!("minterpolate=fps={fps}:mi_mode=dup")
}

fn classic_down(fps: u32) -> String {
    format!("minterpolate=fps={fps}:mi_mode=mci:mc_mode=aobmc:me_mode=bidir:vsbmc=1")
}

/// Interpolation chain for one worker, up or down pass, primary or
/// alternate filter family.
pub fn interp_chain(params: &StageParams) -> FilterChain {
    let interp = match (params.pass, params.alt_algorithm) {
        (InterpPass::Up, false) => {
            if params.use_mixer {
                mixer_interpolate(params.target_fps)
            } else {
                passthrough_interpolate(params.target_fps)
            }
        }
        (InterpPass::Up, true) => classic_up(params.target_fps),
        (InterpPass::Down, false) => mixer_interpolate(params.target_fps),
        (InterpPass::Down, true) => classic_down(params.target_fps),
    };

    FilterChain::from_input("0:v")
        .link("decim", even_full_range_scale())
        .link("middle", decimate(params.decim_max, params.decim_frac))
        .link("interp", interp)
        .link("out", full_chroma_scale())
}

/// Final assembly chain. The mixer variant is used when any drop/dup frames
/// were observed anywhere in the job; constant frame rate is enforced
/// explicitly either way.
pub fn assemble_chain(target_fps: u32, use_mixer: bool) -> FilterChain {
    let interp = if use_mixer {
        mixer_interpolate(target_fps)
    } else {
        passthrough_interpolate(target_fps)
    };

    FilterChain::from_input("0:v")
        .link("decim", even_full_range_scale())
        .link("middle", interp)
        .link("interp", format!("fps={target_fps}:round=near"))
        .link("out", full_chroma_scale())
}
