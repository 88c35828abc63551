//! # Loss curve
//!
//! Renders the per-epoch training and validation losses as a PNG chart in the
//! ggplot style: grey panel, dashed white grid, solid blue training curve and
//! dashed red validation curve, titled and labelled with the bundled DejaVu
//! Sans font.
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::path::Path;

static FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const PANEL: Rgb<u8> = Rgb([229, 229, 229]);
const GRID: Rgb<u8> = Rgb([255, 255, 255]);
pub const TRAIN_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const VAL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT: Rgb<u8> = Rgb([0, 0, 0]);
const TICK_TEXT: Rgb<u8> = Rgb([77, 77, 77]);

pub const TITLE: &str = "Loss Curve Over Epochs";
pub const X_LABEL: &str = "Epochs";
pub const Y_LABEL: &str = "Loss";
pub const TRAIN_LABEL: &str = "Training Loss";
pub const VAL_LABEL: &str = "Validation Loss";

/// Maps (epoch, loss) pairs to pixel coordinates inside the panel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Axes {
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
    n_epochs: usize,
    y_min: f64,
    y_max: f64,
}

impl Axes {
    fn new(panel: Rect, n_epochs: usize, values: &[f64]) -> Self {
        let (mut y_min, mut y_max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = y_max - y_min;
        let pad = if span > 0. { span * 0.05 } else { y_max.abs().max(1.) * 0.05 };
        y_min -= pad;
        y_max += pad;
        Self {
            left: panel.left() as f32,
            right: panel.right() as f32,
            top: panel.top() as f32,
            bottom: panel.bottom() as f32,
            n_epochs,
            y_min,
            y_max,
        }
    }

    fn to_pixel(&self, epoch: usize, value: f64) -> (f32, f32) {
        let x = if self.n_epochs > 1 {
            self.left + (self.right - self.left) * epoch as f32 / (self.n_epochs - 1) as f32
        } else {
            (self.left + self.right) / 2.
        };
        let ratio = ((value - self.y_min) / (self.y_max - self.y_min)) as f32;
        let y = self.bottom - (self.bottom - self.top) * ratio;
        (x, y)
    }
}

fn load_font() -> anyhow::Result<Font<'static>> {
    Font::try_from_bytes(FONT).ok_or_else(|| anyhow::anyhow!("invalid bundled font"))
}

/// Formats a tick value with enough decimals to tell neighbouring ticks
/// `step` apart.
fn tick_label(value: f64, step: f64) -> String {
    let decimals = if step > 0. { ((-step.log10()).ceil() as i32 + 1).clamp(0, 6) } else { 3 };
    format!("{:.*}", decimals as usize, value)
}

/// Indexes of the labelled epochs, at most about ten of them.
fn epoch_ticks(n_epochs: usize) -> Vec<usize> {
    let step = ((n_epochs + 9) / 10).max(1);
    (0..n_epochs).step_by(step).collect()
}

/// A straight segment with some thickness, optionally dashed.
fn draw_segment(
    image: &mut RgbImage,
    start: (f32, f32),
    end: (f32, f32),
    color: Rgb<u8>,
    thickness: i32,
    dash: Option<(f32, f32)>,
) {
    let (dx, dy) = (end.0 - start.0, end.1 - start.1);
    let length = (dx * dx + dy * dy).sqrt();
    if length == 0. {
        return;
    }
    let pieces: Vec<(f32, f32)> = match dash {
        None => vec![(0., 1.)],
        Some((on, off)) => {
            let mut pieces = vec![];
            let mut from = 0.;
            while from < length {
                pieces.push((from / length, ((from + on) / length).min(1.)));
                from += on + off;
            }
            pieces
        }
    };
    let half = thickness / 2;
    for (a, b) in pieces {
        let p0 = (start.0 + dx * a, start.1 + dy * a);
        let p1 = (start.0 + dx * b, start.1 + dy * b);
        for offset in -half..=half {
            let o = offset as f32;
            // Offset along the axis that is the most perpendicular to the segment.
            let (ox, oy) = if dx.abs() > dy.abs() { (0., o) } else { (o, 0.) };
            draw_line_segment_mut(image, (p0.0 + ox, p0.1 + oy), (p1.0 + ox, p1.1 + oy), color);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LossCurve {
    pub width: u32,
    pub height: u32,
    pub line_width: i32,
    /// Number of intervals between the horizontal grid lines.
    pub grid_lines: usize,
}

impl Default for LossCurve {
    /// A 10x6 inches figure at 300 dpi.
    fn default() -> Self {
        Self { width: 3000, height: 1800, line_width: 7, grid_lines: 5 }
    }
}

impl LossCurve {
    /// Sizes are given for the default figure and scaled down with it.
    fn scale(&self) -> f32 {
        (self.width as f32 / 3000.).min(self.height as f32 / 1800.)
    }

    fn panel(&self) -> Rect {
        let s = self.scale();
        let left = (330. * s) as i32;
        let top = (170. * s) as i32;
        let right = self.width as i32 - (60. * s) as i32;
        let bottom = self.height as i32 - (210. * s) as i32;
        Rect::at(left, top).of_size((right - left).max(1) as u32, (bottom - top).max(1) as u32)
    }

    fn draw_series(&self, image: &mut RgbImage, axes: &Axes, values: &[f64], color: Rgb<u8>, dashed: bool) {
        let scale = self.scale();
        let dash = if dashed { Some((40. * scale, 25. * scale)) } else { None };
        let points: Vec<(usize, (f32, f32))> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, &v)| (i, axes.to_pixel(i, v)))
            .collect();
        for pair in points.windows(2) {
            // Gaps in the series (non finite values) are not bridged.
            if pair[1].0 == pair[0].0 + 1 {
                draw_segment(image, pair[0].1, pair[1].1, color, self.line_width, dash);
            }
        }
        if points.len() == 1 {
            let (x, y) = points[0].1;
            draw_filled_circle_mut(image, (x as i32, y as i32), self.line_width * 2, color);
        }
    }

    fn draw_legend(&self, image: &mut RgbImage, font: &Font) {
        let s = self.scale();
        let text = Scale::uniform(50. * s);
        let (text_w, text_h) = text_size(text, font, VAL_LABEL);
        let (pad, sample) = (30. * s, 120. * s);
        let row = text_h as f32 + 30. * s;
        let w = (pad + sample + 20. * s + text_w as f32 + pad) as u32;
        let h = (2. * row + pad) as u32;
        let panel = self.panel();
        let x = panel.right() - w as i32 - (30. * s) as i32;
        let y = panel.top() + (30. * s) as i32;
        if w == 0 || h == 0 {
            return;
        }
        draw_filled_rect_mut(image, Rect::at(x, y).of_size(w, h), BACKGROUND);
        let (x0, x1) = (x as f32 + pad, x as f32 + pad + sample);
        let dash = Some((40. * s, 25. * s));
        let rows = [(TRAIN_LABEL, TRAIN_COLOR, None), (VAL_LABEL, VAL_COLOR, dash)];
        for (i, (label, color, dash)) in rows.into_iter().enumerate() {
            let y_row = y as f32 + pad / 2. + row * (i as f32 + 0.5);
            draw_segment(image, (x0, y_row), (x1, y_row), color, self.line_width, dash);
            let text_x = (x1 + 20. * s) as i32;
            draw_text_mut(image, TEXT, text_x, (y_row - text_h as f32 / 2.) as i32, text, font, label);
        }
    }

    fn draw_title(&self, image: &mut RgbImage, font: &Font) {
        let s = self.scale();
        let size = Scale::uniform(67. * s);
        let (w, h) = text_size(size, font, TITLE);
        let x = (self.width as i32 - w) / 2;
        let y = (self.panel().top() - h) / 2;
        // Drawn twice with a small offset for a bold look.
        for offset in 0..=(2. * s).round().max(1.) as i32 {
            draw_text_mut(image, TEXT, x + offset, y, size, font, TITLE);
        }
    }

    /// Tick values along both axes, then the axis labels beyond them.
    fn draw_axis_text(&self, image: &mut RgbImage, font: &Font, axes: &Axes, y_ticks: &[(f32, f64)], step: f64) {
        let s = self.scale();
        let tick = Scale::uniform(42. * s);
        let gap = (15. * s) as i32;
        let mut max_tick_w = 0;
        for &(y, value) in y_ticks {
            let label = tick_label(value, step);
            let (w, h) = text_size(tick, font, &label);
            max_tick_w = max_tick_w.max(w);
            draw_text_mut(image, TICK_TEXT, axes.left as i32 - gap - w, y as i32 - h / 2, tick, font, &label);
        }
        let mut tick_h = 0;
        for i in epoch_ticks(axes.n_epochs) {
            let label = (i + 1).to_string();
            let (w, h) = text_size(tick, font, &label);
            tick_h = tick_h.max(h);
            let (x, _) = axes.to_pixel(i, axes.y_min);
            draw_text_mut(image, TICK_TEXT, x as i32 - w / 2, axes.bottom as i32 + gap, tick, font, &label);
        }

        let label = Scale::uniform(58. * s);
        let (w, _) = text_size(label, font, X_LABEL);
        let x = ((axes.left + axes.right) / 2.) as i32 - w / 2;
        let y = axes.bottom as i32 + gap + tick_h + (25. * s) as i32;
        draw_text_mut(image, TEXT, x, y, label, font, X_LABEL);

        // The y label reads upwards: drawn horizontally, then rotated.
        let (w, h) = text_size(label, font, Y_LABEL);
        if w <= 0 || h <= 0 {
            return;
        }
        let mut horizontal = RgbImage::from_pixel(w as u32 + 2, h as u32 + 2, BACKGROUND);
        draw_text_mut(&mut horizontal, TEXT, 1, 1, label, font, Y_LABEL);
        let vertical = imageops::rotate270(&horizontal);
        let x = axes.left as i32 - gap - max_tick_w - (25. * s) as i32 - vertical.width() as i32;
        let y = ((axes.top + axes.bottom) / 2.) as i32 - vertical.height() as i32 / 2;
        imageops::overlay(image, &vertical, x.max(0) as i64, y as i64);
    }

    pub fn render(&self, train: &[f64], val: &[f64]) -> anyhow::Result<RgbImage> {
        if self.width < 100 || self.height < 60 {
            anyhow::bail!("plot of {}x{} is too small, at least 100x60 is needed", self.width, self.height)
        }
        let finite: Vec<f64> =
            train.iter().chain(val.iter()).copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            anyhow::bail!("no finite loss value to plot")
        }
        let font = load_font()?;
        let mut image = RgbImage::from_pixel(self.width, self.height, BACKGROUND);
        let panel = self.panel();
        draw_filled_rect_mut(&mut image, panel, PANEL);
        let axes = Axes::new(panel, train.len().max(val.len()), &finite);
        let scale = self.scale();
        let grid_dash = Some((20. * scale, 15. * scale));
        let intervals = self.grid_lines.max(1);
        let step = (axes.y_max - axes.y_min) / intervals as f64;
        let mut y_ticks = vec![];
        for i in 0..=intervals {
            let value = axes.y_min + step * i as f64;
            let (_, y) = axes.to_pixel(0, value);
            draw_segment(&mut image, (axes.left, y), (axes.right, y), GRID, 1, grid_dash);
            y_ticks.push((y, value));
        }
        for i in epoch_ticks(axes.n_epochs) {
            let (x, _) = axes.to_pixel(i, axes.y_min);
            draw_segment(&mut image, (x, axes.top), (x, axes.bottom), GRID, 1, grid_dash);
        }
        self.draw_series(&mut image, &axes, train, TRAIN_COLOR, false);
        self.draw_series(&mut image, &axes, val, VAL_COLOR, true);
        self.draw_legend(&mut image, &font);
        self.draw_title(&mut image, &font);
        self.draw_axis_text(&mut image, &font, &axes, &y_ticks, step);
        Ok(image)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, train: &[f64], val: &[f64]) -> anyhow::Result<()> {
        let image = self.render(train, val)?;
        crate::utils::create_parent_dir(&path)?;
        image.save(path.as_ref())?;
        tracing::info!("saved the loss curve to {:?}", path.as_ref().to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::scratch_dir;

    fn small() -> LossCurve {
        LossCurve { width: 300, height: 200, line_width: 3, grid_lines: 4 }
    }

    fn count(image: &RgbImage, color: Rgb<u8>) -> usize {
        image.pixels().filter(|p| **p == color).count()
    }

    /// Text is the only dark ink of the chart.
    fn dark_pixels(image: &RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> usize {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| image.get_pixel(x, y).0.iter().all(|&c| c < 128))
            .count()
    }

    #[test]
    fn axes_map_the_extremes() {
        let panel = Rect::at(10, 10).of_size(101, 51);
        let axes = Axes::new(panel, 3, &[1., 2.]);
        let (x0, y0) = axes.to_pixel(0, axes.y_min);
        let (x2, y2) = axes.to_pixel(2, axes.y_max);
        assert_eq!((x0, y0), (10., 60.));
        assert_eq!((x2, y2), (110., 10.));
        let (_, y_low) = axes.to_pixel(1, 1.);
        let (_, y_high) = axes.to_pixel(1, 2.);
        assert!(y_low > y_high);
        assert!(y_low < 60. && y_high > 10.);
    }

    #[test]
    fn flat_series_gets_a_range() {
        let panel = Rect::at(0, 0).of_size(10, 10);
        let axes = Axes::new(panel, 2, &[0.5, 0.5]);
        assert!(axes.y_min < 0.5 && axes.y_max > 0.5);
    }

    #[test]
    fn tick_labels() {
        assert_eq!(tick_label(0.25, 0.05), "0.250");
        assert_eq!(tick_label(12., 2.5), "12.0");
        assert_eq!(tick_label(1500., 200.), "1500");
        assert_eq!(epoch_ticks(4), vec![0, 1, 2, 3]);
        assert_eq!(epoch_ticks(25), vec![0, 3, 6, 9, 12, 15, 18, 21, 24]);
        assert!(epoch_ticks(0).is_empty());
    }

    #[test]
    fn draws_both_curves() {
        let image = small().render(&[0.9, 0.5, 0.3, 0.25], &[1.0, 0.6, 0.45, 0.4]).unwrap();
        assert_eq!(image.dimensions(), (300, 200));
        assert!(count(&image, TRAIN_COLOR) > 100);
        assert!(count(&image, VAL_COLOR) > 50);
        assert!(count(&image, PANEL) > 1000);
        assert_eq!(image.get_pixel(0, 0), &BACKGROUND);
    }

    #[test]
    fn labels_the_chart() {
        let curve = LossCurve { width: 600, height: 360, line_width: 3, grid_lines: 5 };
        let image = curve.render(&[0.9, 0.5, 0.3, 0.25], &[1.0, 0.6, 0.45, 0.4]).unwrap();
        let panel = curve.panel();
        let (left, top) = (panel.left() as u32, panel.top() as u32);
        let (right, bottom) = (panel.right() as u32, panel.bottom() as u32);
        // Title above the panel.
        assert!(dark_pixels(&image, 0..600, 0..top) > 20);
        // Loss ticks and the y label left of it.
        assert!(dark_pixels(&image, 0..left, top..bottom) > 20);
        // Epoch ticks and the x label below it.
        assert!(dark_pixels(&image, left..right, bottom + 1..360) > 20);
        // Legend labels in the upper right corner of the panel.
        let middle = (left + right) / 2;
        assert!(dark_pixels(&image, middle..right, top..(top + bottom) / 2) > 20);
        // Nothing dark in the lower left part of the panel, where no text goes.
        assert_eq!(dark_pixels(&image, left + 1..middle, (top + bottom) / 2..bottom), 0);
    }

    #[test]
    fn single_epoch_draws_markers() {
        let image = small().render(&[0.5], &[0.6]).unwrap();
        assert!(count(&image, TRAIN_COLOR) > 0);
        assert!(count(&image, VAL_COLOR) > 0);
    }

    #[test]
    fn rejects_empty_or_degenerate_input() {
        assert!(small().render(&[], &[]).is_err());
        assert!(small().render(&[f64::NAN], &[]).is_err());
        let tiny = LossCurve { width: 10, height: 10, ..small() };
        assert!(tiny.render(&[1.], &[1.]).is_err());
    }

    #[test]
    fn saves_png() {
        let dir = scratch_dir("plot");
        let path = dir.join("out").join("loss_curve.png");
        small().save(&path, &[0.3, 0.2], &[0.35, 0.3]).unwrap();
        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (300, 200));
    }
}
