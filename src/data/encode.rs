use ndarray::{Array2, Axis};

use super::model::{RawSplit, TaskData, NUM_CLASSES};
use crate::error::{DataError, Result};

// ---------------------------------------------------------------------------
// One-hot encoding
// ---------------------------------------------------------------------------

/// Encode `labels` as a `classes × labels.len()` matrix with a single 1.0 in
/// each column, at the row equal to the label.
///
/// Fails on the first label outside `0..classes`.
pub fn one_hot(labels: &[i64], classes: usize) -> Result<Array2<f64>> {
    let mut encoded = Array2::zeros((classes, labels.len()));
    for (index, &label) in labels.iter().enumerate() {
        let row = usize::try_from(label)
            .ok()
            .filter(|&row| row < classes)
            .ok_or(DataError::LabelOutOfRange {
                index,
                label,
                classes,
            })?;
        encoded[[row, index]] = 1.0;
    }
    Ok(encoded)
}

/// Recover labels from a one-hot (or score) matrix by taking the arg-max of
/// every column. Ties resolve to the lowest row.
pub fn decode_one_hot(encoded: &Array2<f64>) -> Vec<i64> {
    encoded
        .axis_iter(Axis(1))
        .map(|column| {
            column
                .iter()
                .enumerate()
                .fold((0usize, f64::NEG_INFINITY), |best, (row, &v)| {
                    if v > best.1 {
                        (row, v)
                    } else {
                        best
                    }
                })
                .0 as i64
        })
        .collect()
}

/// Lay out every sample of `split` features-first with one-hot targets.
///
/// * `x`: `features × m`
/// * `y`: `NUM_CLASSES × m`
pub fn multiclass_task(split: &RawSplit) -> Result<TaskData> {
    let y = one_hot(&split.labels, NUM_CLASSES)?;
    let x = split.images.t().as_standard_layout().into_owned();
    Ok(TaskData { x, y })
}
