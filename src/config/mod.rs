//! Typed reduction configuration.
//!
//! Upstream tooling resolves configuration files (sections, inheritance,
//! `${section:key}` interpolation) into a flat mapping of dotted keys to
//! scalar values. This module turns that mapping into [`ReduceConfig`]:
//!
//! - every recognized key is listed in [`KNOWN_KEYS`] with its default
//! - a value of the wrong type is an error
//! - an unrecognized key is a warning (logged and returned as an [`Issue`])

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::combine::{CombineMode, CombineOptions};
use crate::domain::Issue;
use crate::error::ReduceError;
use crate::extract::ExtractOptions;
use crate::math::EdgeMode;
use crate::trace::{SeparationProfile, TraceOptions};

/// A resolved configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Every key the reduction core understands.
pub const KNOWN_KEYS: &[&str] = &[
    "data.exptime_key",
    "data.frametype_key",
    "data.obsdate_key",
    "reduce.bias.cosmic_clip",
    "reduce.bias.maxiter",
    "reduce.bias.smooth",
    "reduce.bias.smooth_sigma",
    "reduce.bias.smooth_mode",
    "reduce.flat.cosmic_clip",
    "reduce.flat.maxiter",
    "reduce.flat.mode",
    "reduce.flat.reject_max",
    "reduce.trace.scan_step",
    "reduce.trace.minimum",
    "reduce.trace.threshold",
    "reduce.trace.separation",
    "reduce.trace.degree",
    "reduce.trace.search_window",
    "reduce.trace.tolerance",
    "reduce.trace.max_gap",
    "reduce.trace.filling",
    "reduce.trace.clipping",
    "reduce.trace.maxiter",
    "reduce.trace.merge_tolerance",
    "reduce.trace.reference_column",
    "reduce.trace.saturation",
    "reduce.extract.method",
    "reduce.extract.lower_limit",
    "reduce.extract.upper_limit",
    "reduce.extract.gain",
    "reduce.extract.read_noise",
    "reduce.extract.cosmic_clip",
    "reduce.extract.maxiter",
    "reduce.extract.profile_window",
];

/// Header keys used to interpret raw frames.
#[derive(Debug, Clone, PartialEq)]
pub struct DataConfig {
    pub exptime_key: String,
    pub frametype_key: String,
    pub obsdate_key: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            exptime_key: "EXPTIME".to_string(),
            frametype_key: "IMAGETYP".to_string(),
            obsdate_key: "DATE-OBS".to_string(),
        }
    }
}

/// Master bias construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasConfig {
    pub combine: CombineOptions,
    pub smooth: bool,
    pub smooth_sigma: f64,
    pub smooth_mode: EdgeMode,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            combine: CombineOptions {
                clip_sigma: 10.0,
                max_iter: 5,
                mode: CombineMode::Mean,
                reject_max: false,
            },
            smooth: false,
            smooth_sigma: 3.0,
            smooth_mode: EdgeMode::Nearest,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReduceConfig {
    pub data: DataConfig,
    pub bias: BiasConfig,
    pub flat: CombineOptions,
    pub trace: TraceOptions,
    pub extract: ExtractOptions,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            bias: BiasConfig::default(),
            flat: CombineOptions {
                clip_sigma: 10.0,
                max_iter: 5,
                mode: CombineMode::Mean,
                reject_max: true,
            },
            trace: TraceOptions::default(),
            extract: ExtractOptions::default(),
        }
    }
}

impl ReduceConfig {
    /// Build the typed configuration, returning warnings for unknown keys.
    pub fn from_map(map: &ConfigMap) -> Result<(Self, Vec<Issue>), ReduceError> {
        let mut issues = Vec::new();
        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                log::warn!("Ignoring unrecognized configuration key `{key}`");
                issues.push(Issue::UnknownConfigKey { key: key.clone() });
            }
        }

        let r = Reader { map };
        let mut cfg = ReduceConfig::default();

        r.string("data.exptime_key", &mut cfg.data.exptime_key)?;
        r.string("data.frametype_key", &mut cfg.data.frametype_key)?;
        r.string("data.obsdate_key", &mut cfg.data.obsdate_key)?;

        r.float("reduce.bias.cosmic_clip", &mut cfg.bias.combine.clip_sigma)?;
        r.usize("reduce.bias.maxiter", &mut cfg.bias.combine.max_iter)?;
        r.bool("reduce.bias.smooth", &mut cfg.bias.smooth)?;
        r.float("reduce.bias.smooth_sigma", &mut cfg.bias.smooth_sigma)?;
        r.parsed("reduce.bias.smooth_mode", &mut cfg.bias.smooth_mode)?;

        r.float("reduce.flat.cosmic_clip", &mut cfg.flat.clip_sigma)?;
        r.usize("reduce.flat.maxiter", &mut cfg.flat.max_iter)?;
        r.parsed("reduce.flat.mode", &mut cfg.flat.mode)?;
        r.bool("reduce.flat.reject_max", &mut cfg.flat.reject_max)?;

        let t = &mut cfg.trace;
        r.usize("reduce.trace.scan_step", &mut t.scan_step)?;
        r.float("reduce.trace.minimum", &mut t.minimum_width)?;
        r.float("reduce.trace.threshold", &mut t.threshold)?;
        if let Some(value) = map.get("reduce.trace.separation") {
            t.separation = match value {
                ConfigValue::Int(v) => SeparationProfile::constant(*v as f64),
                ConfigValue::Float(v) => SeparationProfile::constant(*v),
                ConfigValue::Text(s) => s
                    .parse()
                    .map_err(|e: String| ReduceError::invalid_config("reduce.trace.separation", e))?,
                other => {
                    return Err(ReduceError::invalid_config(
                        "reduce.trace.separation",
                        format!("expected a number or 'row:sep, ...' string, got {other:?}"),
                    ));
                }
            };
        }
        r.usize("reduce.trace.degree", &mut t.degree)?;
        r.float("reduce.trace.search_window", &mut t.search_window)?;
        r.float("reduce.trace.tolerance", &mut t.tolerance)?;
        r.usize("reduce.trace.max_gap", &mut t.max_gap)?;
        r.float("reduce.trace.filling", &mut t.filling)?;
        r.float("reduce.trace.clipping", &mut t.clipping)?;
        r.usize("reduce.trace.maxiter", &mut t.max_iter)?;
        r.float("reduce.trace.merge_tolerance", &mut t.merge_tolerance)?;
        if map.contains_key("reduce.trace.reference_column") {
            let mut col = 0usize;
            r.usize("reduce.trace.reference_column", &mut col)?;
            t.reference_column = Some(col);
        }
        if map.contains_key("reduce.trace.saturation") {
            let mut level = 0.0;
            r.float("reduce.trace.saturation", &mut level)?;
            t.saturation = Some(level);
        }

        let e = &mut cfg.extract;
        r.parsed("reduce.extract.method", &mut e.method)?;
        r.float("reduce.extract.lower_limit", &mut e.lower)?;
        r.float("reduce.extract.upper_limit", &mut e.upper)?;
        r.float("reduce.extract.gain", &mut e.gain)?;
        r.float("reduce.extract.read_noise", &mut e.read_noise)?;
        r.float("reduce.extract.cosmic_clip", &mut e.cosmic_clip)?;
        r.usize("reduce.extract.maxiter", &mut e.max_iter)?;
        r.usize("reduce.extract.profile_window", &mut e.profile_window)?;

        cfg.validate()?;
        Ok((cfg, issues))
    }

    /// Range checks that individual key parsers cannot express.
    pub fn validate(&self) -> Result<(), ReduceError> {
        positive("reduce.bias.cosmic_clip", self.bias.combine.clip_sigma)?;
        positive("reduce.flat.cosmic_clip", self.flat.clip_sigma)?;
        if self.bias.smooth {
            positive("reduce.bias.smooth_sigma", self.bias.smooth_sigma)?;
        }
        let t = &self.trace;
        if t.scan_step == 0 {
            return Err(ReduceError::invalid_config("reduce.trace.scan_step", "must be > 0"));
        }
        positive("reduce.trace.threshold", t.threshold)?;
        positive("reduce.trace.search_window", t.search_window)?;
        positive("reduce.trace.tolerance", t.tolerance)?;
        positive("reduce.trace.clipping", t.clipping)?;
        positive("reduce.trace.merge_tolerance", t.merge_tolerance)?;
        if !(0.0..=1.0).contains(&t.filling) {
            return Err(ReduceError::invalid_config(
                "reduce.trace.filling",
                format!("{} is not a fraction in [0, 1]", t.filling),
            ));
        }
        let e = &self.extract;
        if !(e.lower.is_finite() && e.upper.is_finite() && e.lower >= 0.0 && e.upper >= 0.0) {
            return Err(ReduceError::invalid_config(
                "reduce.extract.lower_limit",
                "aperture limits must be finite and non-negative",
            ));
        }
        if e.lower + e.upper <= 0.0 {
            return Err(ReduceError::invalid_config(
                "reduce.extract.upper_limit",
                "aperture has zero width",
            ));
        }
        positive("reduce.extract.gain", e.gain)?;
        positive("reduce.extract.cosmic_clip", e.cosmic_clip)?;
        Ok(())
    }
}

fn positive(key: &str, value: f64) -> Result<(), ReduceError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ReduceError::invalid_config(key, format!("{value} must be a positive number")))
    }
}

/// Typed lookups that leave the default in place when a key is absent.
struct Reader<'a> {
    map: &'a ConfigMap,
}

impl Reader<'_> {
    fn float(&self, key: &str, slot: &mut f64) -> Result<(), ReduceError> {
        match self.map.get(key) {
            None => Ok(()),
            Some(ConfigValue::Float(v)) => {
                *slot = *v;
                Ok(())
            }
            Some(ConfigValue::Int(v)) => {
                *slot = *v as f64;
                Ok(())
            }
            Some(ConfigValue::Text(s)) => {
                *slot = s
                    .trim()
                    .parse()
                    .map_err(|_| ReduceError::invalid_config(key, format!("'{s}' is not a number")))?;
                Ok(())
            }
            Some(other) => Err(ReduceError::invalid_config(key, format!("expected a number, got {other:?}"))),
        }
    }

    fn usize(&self, key: &str, slot: &mut usize) -> Result<(), ReduceError> {
        match self.map.get(key) {
            None => Ok(()),
            Some(ConfigValue::Int(v)) if *v >= 0 => {
                *slot = *v as usize;
                Ok(())
            }
            Some(ConfigValue::Text(s)) => {
                *slot = s.trim().parse().map_err(|_| {
                    ReduceError::invalid_config(key, format!("'{s}' is not a non-negative integer"))
                })?;
                Ok(())
            }
            Some(other) => Err(ReduceError::invalid_config(
                key,
                format!("expected a non-negative integer, got {other:?}"),
            )),
        }
    }

    fn bool(&self, key: &str, slot: &mut bool) -> Result<(), ReduceError> {
        match self.map.get(key) {
            None => Ok(()),
            Some(ConfigValue::Bool(v)) => {
                *slot = *v;
                Ok(())
            }
            Some(ConfigValue::Text(s)) => {
                *slot = match s.trim().to_ascii_lowercase().as_str() {
                    "yes" | "true" | "on" | "1" => true,
                    "no" | "false" | "off" | "0" => false,
                    _ => return Err(ReduceError::invalid_config(key, format!("'{s}' is not a boolean"))),
                };
                Ok(())
            }
            Some(other) => Err(ReduceError::invalid_config(key, format!("expected a boolean, got {other:?}"))),
        }
    }

    fn string(&self, key: &str, slot: &mut String) -> Result<(), ReduceError> {
        match self.map.get(key) {
            None => Ok(()),
            Some(ConfigValue::Text(s)) => {
                *slot = s.clone();
                Ok(())
            }
            Some(other) => Err(ReduceError::invalid_config(key, format!("expected a string, got {other:?}"))),
        }
    }

    fn parsed<T>(&self, key: &str, slot: &mut T) -> Result<(), ReduceError>
    where
        T: std::str::FromStr<Err = String>,
    {
        match self.map.get(key) {
            None => Ok(()),
            Some(ConfigValue::Text(s)) => {
                *slot = s.parse().map_err(|e: String| ReduceError::invalid_config(key, e))?;
                Ok(())
            }
            Some(other) => Err(ReduceError::invalid_config(key, format!("expected a string, got {other:?}"))),
        }
    }
}

/// Method-name lookups used by `parsed`.
impl std::str::FromStr for CombineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(CombineMode::Mean),
            "sum" => Ok(CombineMode::Sum),
            "median" => Ok(CombineMode::Median),
            other => Err(format!("unknown combine mode '{other}' (expected mean, sum or median)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExtractMethod;

    fn map(entries: &[(&str, ConfigValue)]) -> ConfigMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let (cfg, issues) = ReduceConfig::from_map(&ConfigMap::new()).unwrap();
        assert!(issues.is_empty());
        assert_eq!(cfg, ReduceConfig::default());
        assert_eq!(cfg.trace.degree, 3);
        assert_eq!(cfg.bias.combine.clip_sigma, 10.0);
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let m = map(&[
            ("reduce.trace.degree", ConfigValue::Int(4)),
            ("reduce.trace.separation", ConfigValue::Text("500:26, 1500:15".into())),
            ("reduce.bias.smooth", ConfigValue::Text("yes".into())),
            ("reduce.extract.method", ConfigValue::Text("optimal".into())),
            ("reduce.extract.upper_limit", ConfigValue::Int(4)),
            ("reduce.flat.mode", ConfigValue::Text("median".into())),
        ]);
        let (cfg, issues) = ReduceConfig::from_map(&m).unwrap();
        assert!(issues.is_empty());
        assert_eq!(cfg.trace.degree, 4);
        assert_eq!(cfg.trace.separation.at(1000.0), 20.5);
        assert!(cfg.bias.smooth);
        assert_eq!(cfg.extract.method, ExtractMethod::Optimal);
        assert_eq!(cfg.extract.upper, 4.0);
        assert_eq!(cfg.flat.mode, CombineMode::Median);
    }

    #[test]
    fn unknown_keys_are_reported_not_accepted() {
        let m = map(&[
            ("reduce.trace.degre", ConfigValue::Int(4)),
            ("reduce.wlcalib.xorder", ConfigValue::Int(3)),
        ]);
        let (cfg, issues) = ReduceConfig::from_map(&m).unwrap();
        assert_eq!(cfg.trace.degree, 3);
        assert_eq!(issues.len(), 2);
        assert!(matches!(&issues[0], Issue::UnknownConfigKey { key } if key == "reduce.trace.degre"));
    }

    #[test]
    fn wrong_types_are_errors() {
        let m = map(&[("reduce.trace.degree", ConfigValue::Bool(true))]);
        let err = ReduceConfig::from_map(&m).unwrap_err();
        assert!(matches!(err, ReduceError::InvalidConfig { ref key, .. } if key == "reduce.trace.degree"));

        let m = map(&[("reduce.trace.filling", ConfigValue::Float(1.5))]);
        assert!(ReduceConfig::from_map(&m).is_err());
    }
}
