//! Reduction pipeline shared by the `reduce` command and the single-stage
//! commands.
//!
//! The full run is:
//! classify frames -> master bias -> master flat -> trace orders -> extract each science frame
//!
//! A [`PipelineContext`] is threaded through every stage: it holds the typed
//! configuration and collects the issues each stage reports.

use chrono::NaiveDateTime;

use crate::combine::{combine, mean_exposure_time, smooth_master};
use crate::config::{ConfigMap, ReduceConfig};
use crate::domain::{ExtractedSpectrum, FrameKind, Issue, MasterFrame, RawFrame, TraceSet};
use crate::error::ReduceError;
use crate::extract::{extract, variance_map};
use crate::trace::{TraceDiagnostics, trace};

/// Configuration plus the issues accumulated while running.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config: ReduceConfig,
    pub issues: Vec<Issue>,
}

impl PipelineContext {
    pub fn new(config: ReduceConfig) -> Self {
        Self {
            config,
            issues: Vec::new(),
        }
    }

    /// Build the typed configuration; unknown keys become the first issues.
    pub fn from_map(map: &ConfigMap) -> Result<Self, ReduceError> {
        let (config, issues) = ReduceConfig::from_map(map)?;
        Ok(Self { config, issues })
    }

    pub fn record(&mut self, issues: impl IntoIterator<Item = Issue>) {
        for issue in issues {
            log::warn!("{issue}");
            self.issues.push(issue);
        }
    }
}

/// Frames sorted by their frame-type header.
#[derive(Debug, Clone, Default)]
pub struct FrameGroups {
    pub bias: Vec<RawFrame>,
    pub flat: Vec<RawFrame>,
    pub science: Vec<RawFrame>,
    /// Names of frames whose type could not be determined.
    pub unknown: Vec<String>,
}

pub fn classify(frames: Vec<RawFrame>, frametype_key: &str) -> FrameGroups {
    let mut groups = FrameGroups::default();
    for frame in frames {
        match frame.header.frame_kind(frametype_key) {
            Some(FrameKind::Bias) => groups.bias.push(frame),
            Some(FrameKind::Flat) => groups.flat.push(frame),
            Some(FrameKind::Science) => groups.science.push(frame),
            None => {
                log::warn!("Skipping frame '{}': no usable {frametype_key} header", frame.name);
                groups.unknown.push(frame.name);
            }
        }
    }
    log::info!(
        "Classified frames: {} bias, {} flat, {} science, {} unknown",
        groups.bias.len(),
        groups.flat.len(),
        groups.science.len(),
        groups.unknown.len()
    );
    groups
}

/// Spectra of one science frame.
#[derive(Debug, Clone)]
pub struct FrameSpectra {
    pub frame: String,
    pub observation_time: Option<NaiveDateTime>,
    pub exposure_time: Option<f64>,
    pub spectra: Vec<ExtractedSpectrum>,
}

/// All computed outputs of a `reduce` run.
#[derive(Debug, Clone)]
pub struct ReductionOutput {
    pub master_bias: Option<MasterFrame>,
    /// Absent when a stored trace set was supplied and no flats were given.
    pub master_flat: Option<MasterFrame>,
    pub traces: TraceSet,
    pub trace_diagnostics: Option<TraceDiagnostics>,
    pub science: Vec<FrameSpectra>,
    pub failed: Vec<String>,
    pub unknown: Vec<String>,
}

/// Combine bias frames (if any) into a master bias.
pub fn build_master_bias(ctx: &PipelineContext, frames: &[RawFrame]) -> Result<Option<MasterFrame>, ReduceError> {
    if frames.is_empty() {
        log::info!("No bias frames; skipping bias correction");
        return Ok(None);
    }
    let cfg = &ctx.config;
    let mut master = combine(frames, &cfg.bias.combine)?;
    master.exposure_time = mean_exposure_time(frames, &cfg.data.exptime_key);
    if cfg.bias.smooth {
        smooth_master(&mut master, cfg.bias.smooth_sigma, cfg.bias.smooth_mode);
    }
    Ok(Some(master))
}

/// Bias-subtract and combine flat frames.
pub fn build_master_flat(
    ctx: &PipelineContext,
    frames: &[RawFrame],
    bias: Option<&MasterFrame>,
) -> Result<MasterFrame, ReduceError> {
    if frames.is_empty() {
        return Err(ReduceError::MissingFrames("flat"));
    }
    let corrected = match bias {
        Some(b) => frames
            .iter()
            .map(|f| subtract_bias(f, b))
            .collect::<Result<Vec<_>, _>>()?,
        None => frames.to_vec(),
    };
    let mut master = combine(&corrected, &ctx.config.flat)?;
    master.exposure_time = mean_exposure_time(frames, &ctx.config.data.exptime_key);
    if let Some(b) = bias {
        master.variance += &b.variance;
    }
    Ok(master)
}

/// Trace orders on the master flat, recording dropped candidates.
pub fn trace_orders(ctx: &mut PipelineContext, flat: &MasterFrame) -> Result<(TraceSet, TraceDiagnostics), ReduceError> {
    let outcome = trace(&flat.data, &ctx.config.trace)?;
    ctx.record(outcome.issues);
    if outcome.traces.is_empty() {
        log::warn!("No orders found on the master flat");
    }
    Ok((outcome.traces, outcome.diagnostics))
}

/// Bias-correct one science frame and extract it.
pub fn reduce_science(
    ctx: &PipelineContext,
    frame: &RawFrame,
    bias: Option<&MasterFrame>,
    traces: &TraceSet,
) -> Result<(FrameSpectra, Vec<Issue>), ReduceError> {
    let cfg = &ctx.config;
    let corrected = match bias {
        Some(b) => subtract_bias(frame, b)?,
        None => frame.clone(),
    };
    let variance = variance_map(
        &corrected.data,
        bias.map(|b| &b.variance),
        cfg.extract.gain,
        cfg.extract.read_noise,
    );
    let outcome = extract(&corrected.data, Some(&variance), traces, &cfg.extract)?;
    Ok((
        FrameSpectra {
            frame: frame.name.clone(),
            observation_time: frame.header.observation_time(&cfg.data.obsdate_key),
            exposure_time: frame.header.exposure_time(&cfg.data.exptime_key),
            spectra: outcome.spectra,
        },
        outcome.issues,
    ))
}

/// Extract each frame in turn. A failing frame is recorded as an issue and
/// listed in the second return value; the others are still extracted.
pub fn extract_frames(
    ctx: &mut PipelineContext,
    frames: &[RawFrame],
    bias: Option<&MasterFrame>,
    traces: &TraceSet,
) -> (Vec<FrameSpectra>, Vec<String>) {
    let mut science = Vec::with_capacity(frames.len());
    let mut failed = Vec::new();
    for frame in frames {
        match reduce_science(ctx, frame, bias, traces) {
            Ok((spectra, issues)) => {
                ctx.record(issues);
                science.push(spectra);
            }
            Err(err) => {
                log::error!("Frame '{}' failed: {err}", frame.name);
                failed.push(frame.name.clone());
                ctx.record([Issue::FrameFailed {
                    frame: frame.name.clone(),
                    error: err.to_string(),
                }]);
            }
        }
    }
    (science, failed)
}

/// Run every stage over `frames`.
///
/// With `stored_traces` the tracing stage is skipped and flats become
/// optional. A failing science frame is recorded as an issue and the
/// remaining frames are still reduced.
pub fn run_reduction(
    ctx: &mut PipelineContext,
    frames: Vec<RawFrame>,
    stored_traces: Option<TraceSet>,
) -> Result<ReductionOutput, ReduceError> {
    if frames.is_empty() {
        return Err(ReduceError::EmptyInput);
    }
    let groups = classify(frames, &ctx.config.data.frametype_key);

    let master_bias = build_master_bias(ctx, &groups.bias)?;

    let (master_flat, traces, trace_diagnostics) = match stored_traces {
        Some(traces) => {
            log::info!("Using stored trace set with {} orders", traces.len());
            let flat = if groups.flat.is_empty() {
                None
            } else {
                Some(build_master_flat(ctx, &groups.flat, master_bias.as_ref())?)
            };
            (flat, traces, None)
        }
        None => {
            let flat = build_master_flat(ctx, &groups.flat, master_bias.as_ref())?;
            let (traces, diagnostics) = trace_orders(ctx, &flat)?;
            (Some(flat), traces, Some(diagnostics))
        }
    };

    let (science, failed) = extract_frames(ctx, &groups.science, master_bias.as_ref(), &traces);

    log::info!(
        "Reduction finished: {} science frames extracted, {} failed, {} issues",
        science.len(),
        failed.len(),
        ctx.issues.len()
    );

    Ok(ReductionOutput {
        master_bias,
        master_flat,
        traces,
        trace_diagnostics,
        science,
        failed,
        unknown: groups.unknown,
    })
}

/// `frame - bias`, keeping name and header.
pub fn subtract_bias(frame: &RawFrame, bias: &MasterFrame) -> Result<RawFrame, ReduceError> {
    if frame.shape() != bias.shape() {
        return Err(ReduceError::ShapeMismatch {
            index: 0,
            name: frame.name.clone(),
            expected: bias.shape(),
            found: frame.shape(),
        });
    }
    Ok(RawFrame {
        name: frame.name.clone(),
        data: &frame.data - &bias.data,
        header: frame.header.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{EchelleModel, NightPlan, synthetic_night};
    use crate::domain::{ColumnFlag, HeaderValue};
    use ndarray::Array2;

    fn night() -> (EchelleModel, Vec<RawFrame>) {
        let model = EchelleModel::demo(150, 300, 24.0);
        let frames = synthetic_night(&model, &NightPlan::default()).unwrap();
        (model, frames)
    }

    #[test]
    fn full_reduction_extracts_every_order() {
        let (model, frames) = night();
        let mut ctx = PipelineContext::new(ReduceConfig::default());
        let out = run_reduction(&mut ctx, frames, None).unwrap();

        assert!(out.master_bias.is_some());
        assert_eq!(out.traces.len(), model.orders.len(), "issues: {:?}", ctx.issues);
        assert_eq!(out.science.len(), 2);
        assert!(out.failed.is_empty());

        let bias = out.master_bias.as_ref().unwrap();
        assert!((bias.data[[10, 10]] - 300.0).abs() < 10.0);

        for spectrum in &out.science[0].spectra {
            let mid = spectrum.flux[150];
            assert!(mid > 0.0, "order {} mid flux {mid}", spectrum.order);
            assert_eq!(spectrum.flags[150], ColumnFlag::Full);
            assert!(spectrum.variance.as_ref().unwrap()[150] > 0.0);
        }
        assert!(out.science[0].observation_time.is_some());
        assert_eq!(out.science[0].exposure_time, Some(600.0));
    }

    #[test]
    fn bad_science_frame_does_not_sink_the_others() {
        let (_, mut frames) = night();
        let mut odd = RawFrame::new("sci_bad", Array2::zeros((10, 10)));
        odd.header.insert("IMAGETYP", HeaderValue::Text("OBJECT".into()));
        frames.push(odd);

        let mut ctx = PipelineContext::new(ReduceConfig::default());
        let out = run_reduction(&mut ctx, frames, None).unwrap();
        assert_eq!(out.science.len(), 2);
        assert_eq!(out.failed, vec!["sci_bad".to_string()]);
        assert!(ctx
            .issues
            .iter()
            .any(|i| matches!(i, Issue::FrameFailed { frame, .. } if frame == "sci_bad")));
    }

    #[test]
    fn missing_flats_without_stored_traces_is_an_error() {
        let (_, frames) = night();
        let no_flats: Vec<RawFrame> = frames
            .into_iter()
            .filter(|f| f.header.frame_kind("IMAGETYP") != Some(FrameKind::Flat))
            .collect();
        let mut ctx = PipelineContext::new(ReduceConfig::default());
        let err = run_reduction(&mut ctx, no_flats.clone(), None).unwrap_err();
        assert!(matches!(err, ReduceError::MissingFrames("flat")));

        let stored = TraceSet::empty(150, 300, 150);
        let out = run_reduction(&mut ctx, no_flats, Some(stored)).unwrap();
        assert!(out.master_flat.is_none());
        assert!(out.science.iter().all(|s| s.spectra.is_empty()));
    }

    #[test]
    fn unknown_config_keys_surface_as_issues() {
        let mut map = ConfigMap::new();
        map.insert(
            "reduce.trace.mystery".to_string(),
            crate::config::ConfigValue::Int(1),
        );
        let ctx = PipelineContext::from_map(&map).unwrap();
        assert_eq!(ctx.issues.len(), 1);
    }
}
