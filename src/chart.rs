use eframe::egui::Color32;

use crate::color::{curve_palette, TRAIN_HUE};
use crate::error::{DataError, Result};

// ---------------------------------------------------------------------------
// Cost chart description
// ---------------------------------------------------------------------------

/// One named line of the chart.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    /// `[epoch, cost]` pairs.
    pub points: Vec<[f64; 2]>,
    pub color: Color32,
}

/// Everything needed to draw the cost curves, independent of rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct CostChart {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<Series>,
}

impl CostChart {
    /// Build the `train` / `val` chart, one point per epoch.
    pub fn from_costs(costs_train: &[f64], costs_val: &[f64]) -> Result<Self> {
        ensure_same_length(costs_train, costs_val)?;

        let palette = curve_palette(2, TRAIN_HUE);
        let series = [("train", costs_train), ("val", costs_val)]
            .into_iter()
            .zip(palette)
            .map(|((name, costs), color)| Series {
                name: name.to_string(),
                points: costs
                    .iter()
                    .enumerate()
                    .map(|(epoch, &cost)| [epoch as f64, cost])
                    .collect(),
                color,
            })
            .collect();

        Ok(CostChart {
            title: "Cost".to_string(),
            x_label: "Epoch".to_string(),
            y_label: "Cost".to_string(),
            series,
        })
    }

    /// Number of epochs plotted.
    pub fn epochs(&self) -> usize {
        self.series.first().map_or(0, |s| s.points.len())
    }

    /// First and last epoch on the x axis, `None` when nothing was recorded.
    pub fn x_range(&self) -> Option<(f64, f64)> {
        let xs = self.series.iter().flat_map(|s| s.points.iter().map(|p| p[0]));
        xs.fold(None, |range, x| match range {
            None => Some((x, x)),
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
        })
    }
}

/// Both cost sequences must describe the same epochs.
pub(crate) fn ensure_same_length(costs_train: &[f64], costs_val: &[f64]) -> Result<()> {
    if costs_train.len() != costs_val.len() {
        return Err(DataError::LengthMismatch {
            train: costs_train.len(),
            val: costs_val.len(),
        });
    }
    Ok(())
}
