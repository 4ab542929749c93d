use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reframe", version)]
#[command(
    about = "Rebuilds high-framerate gameplay captures into interpolated, editor-friendly master files"
)]
pub struct Cli {
    /// Input file (repeat for multiple inputs)
    #[arg(short = 'i', long = "input", value_name = "PATH", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file; must end in .mkv and must not exist yet
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: PathBuf,

    /// Put all temporary files here instead of next to each input
    #[arg(short = 't', long = "tempdir", value_name = "PATH")]
    pub tempdir: Option<PathBuf>,

    /// Route a second audio stream into a sibling .wav
    #[arg(short = 's', long = "splitaudio")]
    pub splitaudio: bool,

    /// Force the 60 fps target even for slow sources
    #[arg(short = 'u', long = "upgrade")]
    pub upgrade: bool,

    /// Raise the interpolation ceiling (never lowers it)
    #[arg(long = "maxfps", value_name = "N")]
    pub maxfps: Option<u32>,

    /// Override the output frame rate (clamped to the ceiling)
    #[arg(long = "targetfps", value_name = "N")]
    pub targetfps: Option<u32>,

    /// Write DEBUG lines to the log and retain all temporary files
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Log every registry lock acquisition
    #[arg(long = "lock-debug")]
    pub lock_debug: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeatable_inputs_and_flags() {
        let cli = Cli::parse_from([
            "reframe", "-i", "a.mkv", "-i", "b.mkv", "-o", "out.mkv", "-s", "-u", "--maxfps",
            "144", "--targetfps", "72", "-D",
        ]);
        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.output, PathBuf::from("out.mkv"));
        assert!(cli.splitaudio);
        assert!(cli.upgrade);
        assert_eq!(cli.maxfps, Some(144));
        assert_eq!(cli.targetfps, Some(72));
        assert!(cli.debug);
        assert!(!cli.lock_debug);
        assert!(cli.tempdir.is_none());
    }

    #[test]
    fn test_input_is_required() {
        assert!(Cli::try_parse_from(["reframe", "-o", "out.mkv"]).is_err());
    }

    #[test]
    fn test_tempdir_long_and_short() {
        let cli = Cli::parse_from(["reframe", "-i", "a.mkv", "-o", "o.mkv", "--tempdir", "/tmp"]);
        assert_eq!(cli.tempdir, Some(PathBuf::from("/tmp")));
        let cli = Cli::parse_from(["reframe", "-i", "a.mkv", "-o", "o.mkv", "-t", "/var"]);
        assert_eq!(cli.tempdir, Some(PathBuf::from("/var")));
    }
}
