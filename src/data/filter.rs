use ndarray::{Array1, Axis};

use super::model::{RawSplit, TaskData};

// ---------------------------------------------------------------------------
// Binary task: digits 0 and 1 only
// ---------------------------------------------------------------------------

/// Return indices of samples labelled 0 or 1, in their original order.
pub fn zero_one_indices(labels: &[i64]) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|&(_, &label)| label == 0 || label == 1)
        .map(|(i, _)| i)
        .collect()
}

/// Keep the 0/1 samples of `split` and lay them out features-first.
///
/// * `x`: `features × m`
/// * `y`: `1 × m`, each entry 0.0 or 1.0
///
/// A split without any 0/1 sample gives `features × 0` and `1 × 0`.
pub fn binary_task(split: &RawSplit) -> TaskData {
    let keep = zero_one_indices(&split.labels);
    if keep.is_empty() {
        log::warn!("No 0/1 samples among {} labels", split.len());
    }

    let x = split
        .images
        .select(Axis(0), &keep)
        .t()
        .as_standard_layout()
        .into_owned();
    let y = Array1::from_iter(keep.iter().map(|&i| split.labels[i] as f64)).insert_axis(Axis(0));

    TaskData { x, y }
}
