//! Fractional-pixel apertures along the cross-dispersion axis.

use crate::domain::ColumnFlag;
use crate::error::ReduceError;

/// Pixels of one column covered by `[center - lower, center + upper]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aperture {
    pub first_row: usize,
    /// Overlap of each pixel with the aperture, in `(0, 1]`.
    pub weights: Vec<f64>,
    pub flag: ColumnFlag,
}

impl Aperture {
    pub fn rows(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.weights
            .iter()
            .enumerate()
            .map(move |(k, w)| (self.first_row + k, *w))
    }
}

/// Build the aperture of `order` at `column`.
///
/// Pixel `i` spans `[i - 0.5, i + 0.5]` and is weighted by the length of its
/// overlap with the aperture. An aperture reaching past the image is clipped
/// and flagged [`ColumnFlag::Partial`]; one with no overlap at all is
/// [`ReduceError::OutOfBounds`].
pub fn column_aperture(
    center: f64,
    lower: f64,
    upper: f64,
    rows: usize,
    order: usize,
    column: usize,
) -> Result<Aperture, ReduceError> {
    let lo = center - lower;
    let hi = center + upper;
    let top = -0.5;
    let bottom = rows as f64 - 0.5;

    let out_of_bounds = ReduceError::OutOfBounds { order, column };
    if !(lo.is_finite() && hi.is_finite()) || rows == 0 || hi <= top || lo >= bottom {
        return Err(out_of_bounds);
    }

    let clipped = lo < top || hi > bottom;
    let first = (lo + 0.5).floor().max(0.0) as usize;
    let last = ((hi - 0.5).ceil().max(0.0) as usize).min(rows - 1);

    let mut weights = Vec::with_capacity(last.saturating_sub(first) + 1);
    let mut first_row = None;
    for i in first..=last {
        let x = i as f64;
        let w = (hi.min(x + 0.5) - lo.max(x - 0.5)).clamp(0.0, 1.0);
        if w <= 0.0 {
            if first_row.is_none() {
                continue;
            }
            break;
        }
        first_row.get_or_insert(i);
        weights.push(w);
    }

    let Some(first_row) = first_row else {
        return Err(out_of_bounds);
    };
    Ok(Aperture {
        first_row,
        weights,
        flag: if clipped { ColumnFlag::Partial } else { ColumnFlag::Full },
    })
}
