//! Merging candidates that describe the same order.
//!
//! Seeds in different scan columns usually land on the same order, so their
//! candidates are grouped by index with a union-find: two candidates join when
//! their fitted centers agree within `merge_tolerance`, averaged over the
//! columns where both have accepted samples.

use std::collections::BTreeMap;

use crate::domain::{DropReason, Issue, TraceSample};
use crate::trace::fit::robust_fit;
use crate::trace::link::bridge;
use crate::trace::{Candidate, TraceOptions};

/// Columns sampled to cheaply rule out pairs before the exact comparison.
const PROBE_POINTS: usize = 16;

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// The smaller index becomes the root.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        true
    }
}

/// Merge duplicate candidates; returns survivors, issues, and how many merges
/// were made.
pub fn merge_duplicates(
    candidates: Vec<Candidate>,
    options: &TraceOptions,
    domain: (f64, f64),
) -> (Vec<Candidate>, Vec<Issue>, usize) {
    let n = candidates.len();
    let accepted: Vec<Vec<usize>> = candidates
        .iter()
        .map(|c| c.samples.iter().filter(|s| s.is_accepted()).map(|s| s.column).collect())
        .collect();

    let mut uf = UnionFind::new(n);
    let mut merges = 0;
    for i in 0..n {
        for j in i + 1..n {
            if !shared_span_close(&candidates[i], &candidates[j], &accepted[i], &accepted[j], options.merge_tolerance) {
                continue;
            }
            let Some(diff) = mean_center_difference(&candidates[i], &candidates[j], &accepted[i], &accepted[j])
            else {
                continue;
            };
            if diff <= options.merge_tolerance && uf.union(i, j) {
                merges += 1;
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        groups.entry(root).or_default().push(i);
    }

    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(groups.len());
    let mut issues = Vec::new();
    for members in groups.into_values() {
        if let [only] = members[..] {
            if let Some(c) = slots[only].take() {
                merged.push(c);
            }
            continue;
        }

        let base = members
            .iter()
            .copied()
            .max_by(|&a, &b| accepted[a].len().cmp(&accepted[b].len()).then(b.cmp(&a)))
            .unwrap_or(members[0]);

        let mut by_column: BTreeMap<usize, TraceSample> = BTreeMap::new();
        let group: Vec<Candidate> = members.iter().filter_map(|&m| slots[m].take()).collect();
        let base_pos = members.iter().position(|&m| m == base).unwrap_or(0);
        let mut ordered: Vec<&Candidate> = vec![&group[base_pos]];
        ordered.extend(group.iter().enumerate().filter(|(k, _)| *k != base_pos).map(|(_, c)| c));
        for cand in ordered {
            for s in cand.samples.iter().filter(|s| !s.interpolated) {
                by_column.entry(s.column).or_insert(TraceSample {
                    rejected: false,
                    ..*s
                });
            }
        }

        let measured: Vec<TraceSample> = by_column.into_values().collect();
        let mut samples = bridge(&measured, options.max_gap);
        let seed = group[base_pos].seed;
        log::debug!(
            "Merged {} candidates into the order seeded at column {}, row {:.2}",
            members.len(),
            seed.0,
            seed.1
        );
        match robust_fit(&mut samples, options.degree, options.clipping, options.max_iter, domain) {
            Ok(fit) => merged.push(Candidate { seed, samples, fit }),
            Err(err) => {
                log::warn!("Refit of merged order seeded at column {} failed: {err}", seed.0);
                issues.push(Issue::CandidateDropped {
                    seed_column: seed.0,
                    seed_row: seed.1,
                    reason: DropReason::FitFailure {
                        points: samples.iter().filter(|s| !s.interpolated).count(),
                        degree: options.degree,
                    },
                });
            }
        }
    }

    (merged, issues, merges)
}

/// Cheap rejection: compare the fits at a few columns of the shared span.
fn shared_span_close(a: &Candidate, b: &Candidate, cols_a: &[usize], cols_b: &[usize], tolerance: f64) -> bool {
    let (Some(&a0), Some(&a1)) = (cols_a.first(), cols_a.last()) else {
        return false;
    };
    let (Some(&b0), Some(&b1)) = (cols_b.first(), cols_b.last()) else {
        return false;
    };
    let (lo, hi) = (a0.max(b0), a1.min(b1));
    if lo > hi {
        return false;
    }
    let step = ((hi - lo) as f64 / (PROBE_POINTS - 1) as f64).max(1.0);
    let mut total = 0.0;
    let mut count = 0usize;
    let mut x = lo as f64;
    while x <= hi as f64 && count < PROBE_POINTS {
        total += (a.center(x) - b.center(x)).abs();
        count += 1;
        x += step;
    }
    count > 0 && total / count as f64 <= 4.0 * tolerance
}

/// Mean |Δ center| over columns accepted in both candidates.
fn mean_center_difference(a: &Candidate, b: &Candidate, cols_a: &[usize], cols_b: &[usize]) -> Option<f64> {
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    let mut count = 0usize;
    while i < cols_a.len() && j < cols_b.len() {
        match cols_a[i].cmp(&cols_b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let x = cols_a[i] as f64;
                total += (a.center(x) - b.center(x)).abs();
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    (count > 0).then(|| total / count as f64)
}
