use eframe::egui::Color32;
use palette::{FromColor, Hsl, ShiftHue, Srgb};

/// Hue of the training curve, in degrees. Validation sits opposite it.
pub const TRAIN_HUE: f32 = 210.0;

/// `n` curve colours: the first at `base_hue`, the rest shifted in equal
/// steps around the wheel.
pub fn curve_palette(n: usize, base_hue: f32) -> Vec<Color32> {
    let base = Hsl::new(base_hue, 0.75, 0.55);
    let step = 360.0 / n.max(1) as f32;
    (0..n)
        .map(|i| to_color32(base.shift_hue(step * i as f32)))
        .collect()
}

fn to_color32(hsl: Hsl) -> Color32 {
    let rgb: Srgb = Srgb::from_color(hsl);
    let rgb: Srgb<u8> = rgb.into_format();
    Color32::from_rgb(rgb.red, rgb.green, rgb.blue)
}
