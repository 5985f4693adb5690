use anyhow::anyhow;
use eframe::egui;

use crate::chart::CostChart;
use crate::ui::plot;

// ---------------------------------------------------------------------------
// eframe App implementation
// ---------------------------------------------------------------------------

pub struct CostViewerApp {
    pub chart: CostChart,
}

impl eframe::App for CostViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // ---- Top panel: title ----
        egui::TopBottomPanel::top("title_bar").show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.heading(self.chart.title.as_str());
            });
        });

        // ---- Central panel: plot ----
        egui::CentralPanel::default().show(ctx, |ui| {
            plot::cost_plot(ui, &self.chart);
        });
    }
}

/// Open a native window showing `chart`; blocks until it is closed.
pub fn show(chart: CostChart) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 600.0])
            .with_min_inner_size([400.0, 300.0]),
        ..Default::default()
    };

    let title = chart.title.clone();
    log::info!("Showing {} epochs of costs", chart.epochs());
    eframe::run_native(
        &title,
        options,
        Box::new(|_cc| Ok(Box::new(CostViewerApp { chart }))),
    )
    .map_err(|e| anyhow!("chart window failed: {e}"))
}

/// Plot training against validation cost, one point per epoch.
///
/// Fails before opening any window if the sequences differ in length.
pub fn plot_training(costs_train: &[f64], costs_val: &[f64]) -> anyhow::Result<()> {
    let chart = CostChart::from_costs(costs_train, costs_val)?;
    show(chart)
}
