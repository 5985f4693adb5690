use eframe::egui::Ui;
use egui_plot::{Corner, Legend, Line, Plot, PlotPoints};

use crate::chart::CostChart;

// ---------------------------------------------------------------------------
// Cost plot (central panel)
// ---------------------------------------------------------------------------

/// Render the cost curves in the central panel.
pub fn cost_plot(ui: &mut Ui, chart: &CostChart) {
    if chart.epochs() == 0 {
        ui.centered_and_justified(|ui: &mut Ui| {
            ui.heading("No costs recorded");
        });
        return;
    }

    Plot::new("cost_plot")
        .legend(Legend::default().position(Corner::LeftTop))
        .x_axis_label(chart.x_label.as_str())
        .y_axis_label(chart.y_label.as_str())
        .allow_boxed_zoom(true)
        .allow_drag(true)
        .allow_scroll(true)
        .allow_zoom(true)
        .show(ui, |plot_ui| {
            for series in &chart.series {
                let points = PlotPoints::from(series.points.clone());
                let line = Line::new(points)
                    .name(&series.name)
                    .color(series.color)
                    .width(1.5);

                plot_ui.line(line);
            }
        });
}
