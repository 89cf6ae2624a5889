//! Top-level application orchestration.
//!
//! `src/main.rs` only maps the result to an exit code; this module:
//! - parses CLI arguments
//! - resolves configuration (JSON file plus `--set` overrides)
//! - reads frames, runs the requested stage(s)
//! - prints stage summaries and writes outputs

use std::path::Path;

use clap::Parser;

use crate::cli::{CombineArgs, Command, ConfigArgs, ExtractArgs, MasterKind, ReduceArgs, SynthArgs, TraceArgs};
use crate::config::{ConfigMap, ConfigValue};
use crate::data::synthetic::{EchelleModel, NightPlan, synthetic_night};
use crate::domain::ExtractMethod;
use crate::error::{AppError, ReduceError};
use crate::io::{
    FrameFile, FrameReader, JsonFrameReader, SpectraSummary, read_config_json, read_master_json, read_trace_csv,
    write_frame_json, write_master_json, write_spectra_csv, write_summary_json, write_trace_csv,
};
use crate::report::format::{
    format_extraction_summary, format_issues, format_master_summary, format_reduction, format_trace_summary,
};

pub mod pipeline;

use pipeline::{FrameSpectra, PipelineContext};

/// Entry point for the `ered` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse_from(std::env::args());

    match cli.command {
        Command::Combine(args) => handle_combine(args),
        Command::Trace(args) => handle_trace(args),
        Command::Extract(args) => handle_extract(args),
        Command::Reduce(args) => handle_reduce(args),
        Command::Synth(args) => handle_synth(args),
    }
}

fn handle_combine(args: CombineArgs) -> Result<(), AppError> {
    let ctx = load_context(&args.config)?;
    let frames = JsonFrameReader.read_frames(&args.frames)?;
    let exptime_key = ctx.config.data.exptime_key.clone();

    let (label, master) = match args.kind {
        MasterKind::Bias => {
            let master = pipeline::build_master_bias(&ctx, &frames)?.ok_or(ReduceError::MissingFrames("bias"))?;
            ("bias", master)
        }
        MasterKind::Flat => {
            let bias = match &args.bias {
                Some(path) => Some(read_master_json(path, &exptime_key)?),
                None => None,
            };
            ("flat", pipeline::build_master_flat(&ctx, &frames, bias.as_ref())?)
        }
    };

    write_master_json(&args.output, &format!("master_{label}"), &master, &exptime_key)?;
    println!("{}", format_master_summary(label, &master));
    println!("{}", format_issues(&ctx.issues));
    Ok(())
}

fn handle_trace(args: TraceArgs) -> Result<(), AppError> {
    let mut ctx = load_context(&args.config)?;
    let flat = read_master_json(&args.flat, &ctx.config.data.exptime_key)?;
    let (traces, diagnostics) = pipeline::trace_orders(&mut ctx, &flat)?;
    write_trace_csv(&args.output, &traces)?;

    println!("{}", format_trace_summary(&traces, Some(&diagnostics)));
    println!("{}", format_issues(&ctx.issues));
    Ok(())
}

fn handle_extract(args: ExtractArgs) -> Result<(), AppError> {
    let mut ctx = load_context(&args.config)?;
    let traces = read_trace_csv(&args.traces)?;
    let bias = match &args.bias {
        Some(path) => Some(read_master_json(path, &ctx.config.data.exptime_key)?),
        None => None,
    };
    let frames = JsonFrameReader.read_frames(&args.frames)?;

    ensure_dir(&args.output_dir)?;
    let (science, failed) = pipeline::extract_frames(&mut ctx, &frames, bias.as_ref(), &traces);
    for frame in &science {
        write_frame_spectra(&args.output_dir, frame, ctx.config.extract.method)?;
        println!("{}", format_extraction_summary(frame));
    }
    println!("{}", format_issues(&ctx.issues));

    if science.is_empty() && !failed.is_empty() {
        return Err(AppError::new(3, format!("all {} frames failed to extract", failed.len())));
    }
    Ok(())
}

fn handle_reduce(args: ReduceArgs) -> Result<(), AppError> {
    let mut ctx = load_context(&args.config)?;
    let stored = match &args.traces {
        Some(path) => Some(read_trace_csv(path)?),
        None => None,
    };
    let frames = JsonFrameReader.read_frames(&args.frames)?;
    let output = pipeline::run_reduction(&mut ctx, frames, stored)?;

    // Outputs: masters, trace table, one spectra CSV + summary per frame.
    ensure_dir(&args.output_dir)?;
    let exptime_key = &ctx.config.data.exptime_key;
    if let Some(bias) = &output.master_bias {
        write_master_json(&args.output_dir.join("master_bias.json"), "master_bias", bias, exptime_key)?;
    }
    if let Some(flat) = &output.master_flat {
        write_master_json(&args.output_dir.join("master_flat.json"), "master_flat", flat, exptime_key)?;
    }
    write_trace_csv(&args.output_dir.join("traces.csv"), &output.traces)?;
    for frame in &output.science {
        write_frame_spectra(&args.output_dir, frame, ctx.config.extract.method)?;
    }

    println!("{}", format_reduction(&output, &ctx.issues));
    Ok(())
}

fn handle_synth(args: SynthArgs) -> Result<(), AppError> {
    let model = EchelleModel::demo(args.rows, args.columns, args.spacing);
    if model.orders.is_empty() {
        return Err(AppError::new(
            2,
            format!("no order fits a {}x{} detector at spacing {}", args.rows, args.columns, args.spacing),
        ));
    }
    let plan = NightPlan {
        bias_frames: args.bias_frames,
        flat_frames: args.flat_frames,
        science_frames: args.science_frames,
        seed: args.seed,
        ..NightPlan::default()
    };
    let frames = synthetic_night(&model, &plan)?;

    ensure_dir(&args.output_dir)?;
    for frame in &frames {
        let path = args.output_dir.join(format!("{}.json", frame.name));
        write_frame_json(&path, &FrameFile::new(&frame.name, &frame.header, &frame.data, None))?;
    }
    println!(
        "Wrote {} frames ({} orders, {}x{}) to {}",
        frames.len(),
        model.orders.len(),
        model.rows,
        model.columns,
        args.output_dir.display()
    );
    Ok(())
}

/// Resolve the configuration mapping and build the typed context.
pub fn load_context(args: &ConfigArgs) -> Result<PipelineContext, AppError> {
    let mut map = match &args.config {
        Some(path) => read_config_json(path)?,
        None => ConfigMap::new(),
    };
    for raw in &args.overrides {
        let (key, value) = parse_override(raw)?;
        map.insert(key, value);
    }
    Ok(PipelineContext::from_map(&map)?)
}

/// Parse `key=value`; the value becomes a bool, integer, float or text.
pub fn parse_override(raw: &str) -> Result<(String, ConfigValue), AppError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(AppError::new(2, format!("override '{raw}' must look like KEY=VALUE")));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(AppError::new(2, format!("override '{raw}' has an empty key")));
    }
    let value = value.trim();
    let parsed = if let Ok(b) = value.parse::<bool>() {
        ConfigValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        ConfigValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ConfigValue::Float(f)
    } else {
        ConfigValue::Text(value.to_string())
    };
    Ok((key.to_string(), parsed))
}

fn write_frame_spectra(dir: &Path, frame: &FrameSpectra, method: ExtractMethod) -> Result<(), ReduceError> {
    write_spectra_csv(&dir.join(format!("{}.spectra.csv", frame.frame)), &frame.spectra)?;
    let summary = SpectraSummary::new(
        &frame.frame,
        frame
            .observation_time
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
        frame.exposure_time,
        method,
        &frame.spectra,
    );
    write_summary_json(&dir.join(format!("{}.summary.json", frame.frame)), &summary)
}

fn ensure_dir(dir: &Path) -> Result<(), ReduceError> {
    std::fs::create_dir_all(dir).map_err(|e| ReduceError::io(format!("failed to create directory '{}'", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_spectra_csv;
    use std::path::PathBuf;

    #[test]
    fn overrides_pick_the_narrowest_type() {
        assert_eq!(parse_override("a.b=true").unwrap().1, ConfigValue::Bool(true));
        assert_eq!(parse_override("a.b=4").unwrap().1, ConfigValue::Int(4));
        assert_eq!(parse_override("a.b=0.5").unwrap().1, ConfigValue::Float(0.5));
        assert_eq!(
            parse_override("reduce.trace.separation = 500:26, 1500:15").unwrap(),
            (
                "reduce.trace.separation".to_string(),
                ConfigValue::Text("500:26, 1500:15".into())
            )
        );
        assert_eq!(parse_override("novalue").unwrap_err().exit_code(), 2);
        assert!(parse_override("=3").is_err());
    }

    #[test]
    fn bad_override_value_is_an_input_error() {
        let args = ConfigArgs {
            config: None,
            overrides: vec!["reduce.trace.degree=three".into()],
        };
        assert_eq!(load_context(&args).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn synth_then_reduce_writes_every_output() {
        let dir = tempfile::tempdir().unwrap();
        let night = dir.path().join("night");
        handle_synth(SynthArgs {
            output_dir: night.clone(),
            rows: 150,
            columns: 300,
            spacing: 24.0,
            bias_frames: 3,
            flat_frames: 3,
            science_frames: 1,
            seed: 11,
        })
        .unwrap();

        let mut frames: Vec<PathBuf> = std::fs::read_dir(&night)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        frames.sort();
        assert_eq!(frames.len(), 7);

        let out = dir.path().join("reduced");
        handle_reduce(ReduceArgs {
            frames,
            traces: None,
            output_dir: out.clone(),
            config: ConfigArgs::default(),
        })
        .unwrap();

        for name in ["master_bias.json", "master_flat.json", "traces.csv", "sci_001.summary.json"] {
            assert!(out.join(name).exists(), "{name} missing");
        }
        let traces = read_trace_csv(&out.join("traces.csv")).unwrap();
        assert_eq!(traces.len(), EchelleModel::demo(150, 300, 24.0).orders.len());
        let rows = read_spectra_csv(&out.join("sci_001.spectra.csv")).unwrap();
        assert_eq!(rows.len(), traces.len() * 300);
    }
}
