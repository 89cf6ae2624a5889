//! Command-line parsing for the `ered` echelle reducer.
//!
//! Parsing stays here; dispatch lives in `crate::app` and the reduction
//! stages never see clap types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ered", version, about = "Echelle spectrograph frame reduction")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Combine bias or flat frames into a master frame.
    Combine(CombineArgs),
    /// Locate echelle orders on a master flat and write the trace table.
    Trace(TraceArgs),
    /// Extract 1D spectra from science frames using a stored trace table.
    Extract(ExtractArgs),
    /// Run the whole chain: master bias, master flat, tracing, extraction.
    ///
    /// Frames are sorted by their frame-type header; unknown types are skipped.
    Reduce(ReduceArgs),
    /// Write a synthetic night of frames (bias, flat, science) as JSON.
    Synth(SynthArgs),
}

/// Configuration sources shared by every reduction command.
#[derive(Debug, Args, Clone, Default)]
pub struct ConfigArgs {
    /// Configuration JSON; nested objects map to dotted keys.
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Override one key, e.g. `--set reduce.trace.degree=5` (repeatable).
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MasterKind {
    Bias,
    Flat,
}

#[derive(Debug, Parser, Clone)]
pub struct CombineArgs {
    /// Frame JSON files to combine.
    #[arg(required = true, value_name = "FRAME")]
    pub frames: Vec<PathBuf>,

    /// Which calibration to build (selects the bias or flat settings).
    #[arg(long, value_enum)]
    pub kind: MasterKind,

    /// Master bias subtracted from each flat before combining.
    #[arg(long, value_name = "JSON")]
    pub bias: Option<PathBuf>,

    /// Output master frame JSON.
    #[arg(short = 'o', long, value_name = "JSON")]
    pub output: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct TraceArgs {
    /// Master flat JSON produced by `ered combine --kind flat`.
    #[arg(long, value_name = "JSON")]
    pub flat: PathBuf,

    /// Output trace table CSV.
    #[arg(short = 'o', long, value_name = "CSV")]
    pub output: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct ExtractArgs {
    /// Science frame JSON files.
    #[arg(required = true, value_name = "FRAME")]
    pub frames: Vec<PathBuf>,

    /// Trace table CSV produced by `ered trace`.
    #[arg(long, value_name = "CSV")]
    pub traces: PathBuf,

    /// Master bias JSON subtracted before extraction.
    #[arg(long, value_name = "JSON")]
    pub bias: Option<PathBuf>,

    /// Directory for `<frame>.spectra.csv` and `<frame>.summary.json`.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct ReduceArgs {
    /// All frame JSON files of the night.
    #[arg(required = true, value_name = "FRAME")]
    pub frames: Vec<PathBuf>,

    /// Reuse a stored trace table instead of tracing the master flat.
    #[arg(long, value_name = "CSV")]
    pub traces: Option<PathBuf>,

    /// Directory for masters, the trace table and spectra.
    #[arg(long, value_name = "DIR", default_value = "reduced")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct SynthArgs {
    /// Directory to write the frames into.
    #[arg(long, value_name = "DIR", default_value = "night")]
    pub output_dir: PathBuf,

    /// Detector rows (cross-dispersion).
    #[arg(long, default_value_t = 300)]
    pub rows: usize,

    /// Detector columns (dispersion).
    #[arg(long, default_value_t = 600)]
    pub columns: usize,

    /// Row spacing between adjacent orders.
    #[arg(long, default_value_t = 28.0)]
    pub spacing: f64,

    #[arg(long, default_value_t = 5)]
    pub bias_frames: usize,

    #[arg(long, default_value_t = 5)]
    pub flat_frames: usize,

    #[arg(long, default_value_t = 2)]
    pub science_frames: usize,

    /// Random seed for noise and cosmic hits.
    #[arg(long, default_value_t = 7)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reduce_with_overrides() {
        let cli = Cli::parse_from([
            "ered",
            "reduce",
            "a.json",
            "b.json",
            "--set",
            "reduce.trace.degree=5",
            "--set",
            "reduce.extract.method=optimal",
            "--output-dir",
            "out",
        ]);
        let Command::Reduce(args) = cli.command else {
            panic!("expected reduce");
        };
        assert_eq!(args.frames.len(), 2);
        assert_eq!(args.config.overrides.len(), 2);
        assert_eq!(args.output_dir, PathBuf::from("out"));
        assert!(args.traces.is_none());
    }

    #[test]
    fn combine_requires_kind_and_frames() {
        assert!(Cli::try_parse_from(["ered", "combine", "-o", "m.json"]).is_err());
        let cli = Cli::try_parse_from(["ered", "combine", "--kind", "flat", "-o", "m.json", "f1.json"]).unwrap();
        let Command::Combine(args) = cli.command else {
            panic!("expected combine");
        };
        assert_eq!(args.kind, MasterKind::Flat);
    }
}
