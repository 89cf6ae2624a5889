//! Bounded iterative rejection.
//!
//! Both frame combination and trace fitting reject outliers the same way:
//! recompute statistics over the surviving elements, flag elements that
//! deviate too far, and repeat until a round flags nothing new or the
//! iteration cap is hit. Exclusions are cumulative.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipOutcome {
    /// `true` for every excluded element.
    pub excluded: Vec<bool>,
    /// Rounds evaluated (including the final, converging one).
    pub iterations: usize,
    /// A round flagged nothing new.
    pub converged: bool,
    /// The last round would have left fewer than `min_keep` survivors and was
    /// not applied.
    pub exhausted: bool,
}

impl ClipOutcome {
    pub fn kept(&self) -> usize {
        self.excluded.iter().filter(|e| !**e).count()
    }
}

/// Run `flag` until it stops flagging new elements, at most `max_iter` times.
///
/// `flag` receives the current exclusion mask and returns the elements it
/// considers outliers under that mask.
pub fn clip_until_stable<F>(
    initial: Vec<bool>,
    max_iter: usize,
    min_keep: usize,
    mut flag: F,
) -> ClipOutcome
where
    F: FnMut(&[bool]) -> Vec<bool>,
{
    let mut excluded = initial;
    let mut iterations = 0;

    for _ in 0..max_iter {
        iterations += 1;
        let flagged = flag(&excluded);

        let mut next = excluded.clone();
        let mut newly = 0usize;
        for (slot, hit) in next.iter_mut().zip(flagged) {
            if hit && !*slot {
                *slot = true;
                newly += 1;
            }
        }

        if newly == 0 {
            return ClipOutcome {
                excluded,
                iterations,
                converged: true,
                exhausted: false,
            };
        }

        let kept = next.iter().filter(|e| !**e).count();
        if kept < min_keep {
            return ClipOutcome {
                excluded,
                iterations,
                converged: false,
                exhausted: true,
            };
        }
        excluded = next;
    }

    ClipOutcome {
        excluded,
        iterations,
        converged: false,
        exhausted: false,
    }
}
