//! Minimum order separation: the profile and its enforcement.

use std::cmp::Ordering;

use crate::domain::{DropReason, Issue};
use crate::trace::Candidate;

/// Minimum distance between adjacent orders as a function of row.
///
/// Parsed from either a constant (`"20"`) or `row:separation` nodes
/// (`"500:26, 1500:15"`). Between nodes the separation is interpolated
/// linearly; beyond the outermost nodes it is held constant.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationProfile {
    /// `(row, separation)` sorted by row; never empty.
    nodes: Vec<(f64, f64)>,
}

impl SeparationProfile {
    pub fn constant(separation: f64) -> Self {
        Self {
            nodes: vec![(0.0, separation)],
        }
    }

    pub fn at(&self, row: f64) -> f64 {
        let nodes = &self.nodes;
        let (first, last) = (nodes[0], nodes[nodes.len() - 1]);
        if row <= first.0 {
            return first.1;
        }
        if row >= last.0 {
            return last.1;
        }
        for pair in nodes.windows(2) {
            let ((r0, s0), (r1, s1)) = (pair[0], pair[1]);
            if row <= r1 {
                let t = (row - r0) / (r1 - r0);
                return s0 + t * (s1 - s0);
            }
        }
        last.1
    }
}

impl Default for SeparationProfile {
    fn default() -> Self {
        Self::constant(20.0)
    }
}

impl std::str::FromStr for SeparationProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(value) = s.parse::<f64>() {
            return if value >= 0.0 && value.is_finite() {
                Ok(Self::constant(value))
            } else {
                Err(format!("separation {value} must be a non-negative number"))
            };
        }

        let mut nodes = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (row, sep) = part
                .split_once(':')
                .ok_or_else(|| format!("'{part}' is not of the form row:separation"))?;
            let row: f64 = row
                .trim()
                .parse()
                .map_err(|_| format!("'{row}' is not a row number"))?;
            let sep: f64 = sep
                .trim()
                .parse()
                .map_err(|_| format!("'{sep}' is not a separation"))?;
            if !(sep >= 0.0 && sep.is_finite()) {
                return Err(format!("separation {sep} at row {row} must be a non-negative number"));
            }
            nodes.push((row, sep));
        }
        if nodes.is_empty() {
            return Err("empty separation profile".to_string());
        }
        nodes.sort_by(|a, b| a.0.total_cmp(&b.0));
        if nodes.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err("separation profile lists the same row twice".to_string());
        }
        Ok(Self { nodes })
    }
}

/// Sort candidates by row at `reference_column` and drop the weaker member of
/// every pair that is too close there or that crosses anywhere in `0..columns`.
///
/// The weaker member has fewer accepted samples; ties go to the larger fit
/// RMS, then to the higher row.
pub fn enforce_separation(
    mut candidates: Vec<Candidate>,
    profile: &SeparationProfile,
    reference_column: usize,
    columns: usize,
) -> (Vec<Candidate>, Vec<Issue>) {
    let x_ref = reference_column as f64;
    candidates.sort_by(|a, b| a.center(x_ref).total_cmp(&b.center(x_ref)));

    let mut issues = Vec::new();
    loop {
        let Some((i, violation)) = first_violation(&candidates, profile, x_ref, columns) else {
            break;
        };
        let (lower, upper) = (&candidates[i], &candidates[i + 1]);
        let drop_upper = weaker(lower, upper) == Ordering::Less;
        let (drop, keep) = if drop_upper { (i + 1, i) } else { (i, i + 1) };

        let kept_row = candidates[keep].center(x_ref);
        let reason = match violation {
            Violation::TooClose { distance, minimum } => DropReason::Separation {
                kept_row,
                distance,
                minimum,
            },
            Violation::Crossing { column } => DropReason::Crossing { kept_row, column },
        };
        let dropped = candidates.remove(drop);
        log::debug!(
            "Dropping order seeded at column {}, row {:.2}: {reason}",
            dropped.seed.0,
            dropped.seed.1
        );
        issues.push(Issue::CandidateDropped {
            seed_column: dropped.seed.0,
            seed_row: dropped.seed.1,
            reason,
        });
    }
    (candidates, issues)
}

/// `Less` when `a` should be kept over `b`.
fn weaker(a: &Candidate, b: &Candidate) -> Ordering {
    b.accepted_count()
        .cmp(&a.accepted_count())
        .then_with(|| a.fit.rms.total_cmp(&b.fit.rms))
        .then(Ordering::Less)
}

enum Violation {
    TooClose { distance: f64, minimum: f64 },
    Crossing { column: usize },
}

fn first_violation(
    candidates: &[Candidate],
    profile: &SeparationProfile,
    x_ref: f64,
    columns: usize,
) -> Option<(usize, Violation)> {
    for i in 0..candidates.len().saturating_sub(1) {
        let (a, b) = (&candidates[i], &candidates[i + 1]);
        let (ra, rb) = (a.center(x_ref), b.center(x_ref));
        let distance = rb - ra;
        let minimum = profile.at(0.5 * (ra + rb));
        if distance < minimum {
            return Some((i, Violation::TooClose { distance, minimum }));
        }
        if let Some(column) = (0..columns).find(|&c| b.center(c as f64) <= a.center(c as f64)) {
            return Some((i, Violation::Crossing { column }));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TraceSample;
    use crate::math::Polynomial;
    use crate::trace::fit::TraceFit;
    use approx::assert_abs_diff_eq;

    fn candidate(row: f64, tilt: f64, accepted: usize) -> Candidate {
        let samples = (0..accepted)
            .map(|c| TraceSample::measured(c, row + tilt * c as f64, 3.0))
            .collect();
        Candidate {
            seed: (0, row),
            samples,
            fit: TraceFit {
                position: Polynomial::new(vec![row + tilt * 50.0, tilt * 50.0], (0.0, 100.0)),
                rms: 0.05,
                iterations: 1,
            },
        }
    }

    #[test]
    fn profile_interpolates_and_clamps() {
        let p: SeparationProfile = "1500:15, 500:26".parse().unwrap();
        assert_abs_diff_eq!(p.at(0.0), 26.0);
        assert_abs_diff_eq!(p.at(1000.0), 20.5);
        assert_abs_diff_eq!(p.at(4000.0), 15.0);
        assert_eq!("12".parse::<SeparationProfile>().unwrap(), SeparationProfile::constant(12.0));
        assert!("500-26".parse::<SeparationProfile>().is_err());
    }

    #[test]
    fn close_pair_keeps_better_sampled_order() {
        let kept = candidate(50.0, 0.0, 90);
        let weak = candidate(55.0, 0.0, 60);
        let far = candidate(90.0, 0.0, 40);
        let (out, issues) =
            enforce_separation(vec![weak, far, kept], &SeparationProfile::constant(20.0), 50, 101);
        let rows: Vec<f64> = out.iter().map(|c| c.center(50.0)).collect();
        assert_eq!(rows, vec![50.0, 90.0]);
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            Issue::CandidateDropped { reason: DropReason::Separation { .. }, seed_row, .. } if *seed_row == 55.0
        ));
    }

    #[test]
    fn crossing_orders_are_resolved() {
        // 30 px apart at column 50, crossing at column 100.
        let a = candidate(40.0, 0.3, 100);
        let b = candidate(100.0, -0.3, 80);
        let (out, issues) = enforce_separation(vec![a, b], &SeparationProfile::constant(10.0), 50, 200);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &issues[0],
            Issue::CandidateDropped { reason: DropReason::Crossing { .. }, .. }
        ));
    }

    #[test]
    fn equal_counts_prefer_lower_rms_then_lower_row() {
        let a = candidate(50.0, 0.0, 60);
        let mut b = candidate(52.0, 0.0, 60);
        b.fit.rms = 0.01;
        let (out, _) = enforce_separation(vec![a.clone(), b], &SeparationProfile::constant(20.0), 50, 101);
        assert_eq!(out[0].center(50.0), 52.0);

        let c = candidate(53.0, 0.0, 60);
        let (out, _) = enforce_separation(vec![c, a], &SeparationProfile::constant(20.0), 50, 101);
        assert_eq!(out[0].center(50.0), 50.0);
    }
}
