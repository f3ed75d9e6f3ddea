//! Overlay layout and per-refresh drawing
//!
//! Everything here works on a [`Canvas`], so it runs the same against a mapped
//! framebuffer or a plain `Vec<u8>`.

use super::canvas::{text_size, Canvas, Rect};
use super::font::{GLYPH_ADVANCE, GLYPH_SIZE};
use super::plot::RollingPlot;

/// Logical canvas before scaling
pub const LOGICAL_SIZE: (u32, u32) = (960, 360);
/// Logical plot size before scaling
const PLOT_SIZE: (i32, i32) = (360, 80);
/// Seconds between vertical grid lines
const GRID_SECONDS: u64 = 10;

pub const FILL_INITIAL: u32 = 0x8000_0000;
pub const FILL_CLEAR: u32 = 0x0000_0000;
const TEXT_BG: u32 = 0x4020_2020;
const LABEL_BG: u32 = 0x5020_2020;
const BORDER: u32 = 0x60FF_FFFF;
const TEXT_FG: u32 = 0xB0FF_FFFF;
const PLOT_BG: u32 = 0x4020_2020;
const GRID: u32 = 0x3090_9090;
const LINE_FG: u32 = 0xB0FF_4040;
const AVG_FG: u32 = 0x80FF_D040;

/// 2x pixel scale on HD and larger modes
pub fn osd_scale(mode_width: u32) -> i32 {
    if mode_width >= 1280 {
        2
    } else {
        1
    }
}

/// Scaled canvas, shrunk to half of the mode along any axis it would overflow
pub fn canvas_size(mode_width: u32, mode_height: u32) -> (u32, u32) {
    let scale = osd_scale(mode_width) as u32;
    let fit = |logical: u32, mode: u32| {
        let scaled = logical * scale;
        if scaled > mode {
            (mode / 2).max(1)
        } else {
            scaled
        }
    };
    (fit(LOGICAL_SIZE.0, mode_width), fit(LOGICAL_SIZE.1, mode_height))
}

/// `12*scale`, kept within `[8, canvas_width/4]`
pub fn margin_px(scale: i32, canvas_width: u32) -> i32 {
    let upper = (canvas_width / 4) as i32;
    (12 * scale).min(upper).max(8)
}

/// Fixed geometry computed once per overlay setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub scale: i32,
    pub margin: i32,
    pub plot: Rect,
}

impl Layout {
    pub fn for_mode(mode_width: u32, mode_height: u32) -> Self {
        let (width, height) = canvas_size(mode_width, mode_height);
        let scale = osd_scale(mode_width);
        let margin = margin_px(scale, width);
        let (cw, ch) = (width as i32, height as i32);

        let plot_w = (PLOT_SIZE.0 * scale)
            .min(cw - 2 * margin)
            .max(80 * scale);
        let plot_h = (PLOT_SIZE.1 * scale)
            .min(ch - 2 * margin)
            .max(40 * scale);
        // room above for the label box
        let label_h = GLYPH_SIZE as i32 * scale + 8 * scale;
        let plot_x = (cw - margin - plot_w).max(margin);
        let plot_y = (margin + label_h + 4 * scale).min((ch - margin - plot_h).max(margin));

        Self {
            width,
            height,
            scale,
            margin,
            plot: Rect::new(plot_x, plot_y, plot_w, plot_h),
        }
    }

    fn line_advance(&self) -> i32 {
        GLYPH_ADVANCE as i32 * self.scale
    }
}

/// Where to try a box around the plot first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxPreference {
    Below,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxAlign {
    Left,
    Right,
}

/// Place a `w`x`h` box next to the plot: preferred side, the other vertical side, right, left
pub fn position_box(layout: &Layout, w: i32, h: i32, pref: BoxPreference, align: BoxAlign) -> (i32, i32) {
    let gap = 4 * layout.scale;
    let m = layout.margin;
    let (cw, ch) = (layout.width as i32, layout.height as i32);
    let p = layout.plot;

    let max_x = (cw - m - w).max(m);
    let base_x = match align {
        BoxAlign::Left => p.x,
        BoxAlign::Right => p.right() - w,
    }
    .clamp(m, max_x);
    let side_y = || {
        let mut y = p.y.max(m);
        if y + h > ch - m {
            y = (ch - m - h).max(m);
        }
        y
    };

    let vertical = match pref {
        BoxPreference::Below => [BoxPreference::Below, BoxPreference::Above],
        BoxPreference::Above => [BoxPreference::Above, BoxPreference::Below],
    };
    for side in vertical {
        match side {
            BoxPreference::Below => {
                let y = p.bottom() + gap;
                if y + h <= ch - m {
                    return (base_x, y);
                }
            }
            BoxPreference::Above => {
                let y = p.y - h - gap;
                if y >= m {
                    return (base_x, y);
                }
            }
        }
    }
    let right = p.right() + gap;
    if right + w <= cw - m {
        return (right, side_y());
    }
    let left = p.x - w - gap;
    if left >= m {
        return (left, side_y());
    }

    let y = match pref {
        BoxPreference::Below => ch - m - h,
        BoxPreference::Above => m,
    };
    (base_x, y.min(ch - m - h).max(m))
}

/// Rectangles drawn on the previous refresh, cleared before redrawing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedRects {
    pub text: Rect,
    pub plot: Rect,
    pub label: Rect,
    pub stats: Rect,
}

/// Content for one refresh
#[derive(Debug, Clone, Default)]
pub struct Frame<'a> {
    pub lines: &'a [String],
    pub label: &'a str,
    pub unit: &'a str,
    /// Receiver statistics were available this refresh
    pub have_stats: bool,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    layout: Layout,
    rects: CachedRects,
}

impl Renderer {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            rects: CachedRects::default(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn rects(&self) -> &CachedRects {
        &self.rects
    }

    fn clear(canvas: &mut Canvas, r: &mut Rect) {
        if !r.is_empty() {
            canvas.fill_rect(*r, FILL_CLEAR);
        }
        *r = Rect::default();
    }

    /// Background, border and lines of text at (x, y) with `pad` inner padding
    fn text_box(&self, canvas: &mut Canvas, x: i32, y: i32, lines: &[&str], pad: i32, bg: u32) -> Rect {
        let s = self.layout.scale;
        let widest = lines.iter().map(|l| text_size(l, s).0).max().unwrap_or(0);
        let r = Rect::new(x, y, widest + 2 * pad, lines.len() as i32 * self.layout.line_advance() + 2 * pad);
        canvas.fill_rect(r, bg);
        canvas.rect_outline(r, s, BORDER);
        let mut ty = y + pad;
        for line in lines {
            canvas.draw_text(x + pad, ty, line, TEXT_FG, s);
            ty += self.layout.line_advance();
        }
        r
    }

    fn draw_text_box(&mut self, canvas: &mut Canvas, lines: &[String]) {
        let mut prev = self.rects.text;
        Self::clear(canvas, &mut prev);
        if lines.is_empty() {
            self.rects.text = Rect::default();
            return;
        }
        let pad = (6 * self.layout.scale).max(4);
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let m = self.layout.margin;
        self.rects.text = self.text_box(canvas, m, m, &refs, pad, TEXT_BG);
    }

    fn draw_plot(&mut self, canvas: &mut Canvas, plot: &mut RollingPlot, unit: &str) {
        let mut prev = self.rects.plot;
        Self::clear(canvas, &mut prev);
        plot.take_clear();

        let s = self.layout.scale;
        let p = self.layout.plot;
        canvas.fill_rect(p, PLOT_BG);
        canvas.rect_outline(p, s, BORDER);

        for i in 1..4 {
            canvas.hline(p.x, p.y + p.h * i / 4, p.w, 1, GRID);
        }
        let window_s = plot.window().as_secs();
        if window_s > GRID_SECONDS {
            let mut t = GRID_SECONDS;
            while t < window_s {
                let gx = p.x + (p.w as u64 * t / window_s) as i32;
                canvas.vline(gx, p.y, p.h, 1, GRID);
                t += GRID_SECONDS;
            }
        }
        canvas.hline(p.x, p.bottom() - s, p.w, s, GRID);
        canvas.vline(p.x, p.y, p.h, s, GRID);

        if let Some(avg) = plot.avg() {
            let ay = plot.value_to_y(avg, p.y, p.h);
            canvas.hline(p.x, ay, p.w, 1, AVG_FG);
        }

        self.draw_legend(canvas, plot.scale(), unit);

        let step = plot.step(p.w);
        let mut prev_pt: Option<(i32, i32)> = None;
        for (i, &v) in plot.samples().iter().enumerate() {
            let x = (p.x + (i as f64 * step).round() as i32).min(p.right() - 1);
            let y = plot.value_to_y(v, p.y, p.h);
            if let Some((px, py)) = prev_pt {
                canvas.line(px, py, x, y, 1, LINE_FG);
            }
            canvas.fill_rect(Rect::new(x, y, s, s), LINE_FG);
            prev_pt = Some((x, y));
        }
        self.rects.plot = p;
    }

    /// "MAX x.xx" box in the top right corner of the plot
    fn draw_legend(&self, canvas: &mut Canvas, scale_max: f64, unit: &str) {
        let s = self.layout.scale;
        let p = self.layout.plot;
        let text = if unit.is_empty() {
            format!("MAX {:.2}", scale_max.max(0.0))
        } else {
            format!("MAX {:.2} {}", scale_max.max(0.0), unit)
        };
        let pad = 4 * s;
        let inset = 4 * s;
        let (tw, _) = text_size(&text, s);
        let (bw, bh) = (tw + 2 * pad, GLYPH_SIZE as i32 * s + 2 * pad);
        let bx = (p.right() - bw - inset).max(p.x);
        let by = (p.y + inset).min(p.bottom() - bh).max(p.y);
        let r = Rect::new(bx, by, bw.min(p.w), bh.min(p.h));
        canvas.fill_rect(r, TEXT_BG);
        canvas.rect_outline(r, s, BORDER);
        canvas.draw_text(bx + pad, by + pad, &text, TEXT_FG, s);
    }

    fn draw_label(&mut self, canvas: &mut Canvas, label: &str) {
        let mut prev = self.rects.label;
        Self::clear(canvas, &mut prev);
        if label.is_empty() {
            self.rects.label = Rect::default();
            return;
        }
        let s = self.layout.scale;
        let pad = 4 * s;
        let (tw, _) = text_size(label, s);
        let (w, h) = (tw + 2 * pad, GLYPH_SIZE as i32 * s + 2 * pad);
        let (x, y) = position_box(&self.layout, w, h, BoxPreference::Above, BoxAlign::Left);
        canvas.fill_rect(Rect::new(x, y, w, h), LABEL_BG);
        canvas.rect_outline(Rect::new(x, y, w, h), s, BORDER);
        canvas.draw_text(x + pad, y + pad, label, TEXT_FG, s);
        self.rects.label = Rect::new(x, y, w, h);
    }

    fn draw_stats(&mut self, canvas: &mut Canvas, plot: &RollingPlot, frame: &Frame) {
        let mut prev = self.rects.stats;
        Self::clear(canvas, &mut prev);
        let lines = footer_lines(plot, frame);
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let s = self.layout.scale;
        let pad = 6 * s;
        let widest = refs.iter().map(|l| text_size(l, s).0).max().unwrap_or(0);
        let (w, h) = (widest + 2 * pad, refs.len() as i32 * self.layout.line_advance() + 2 * pad);
        let (x, y) = position_box(&self.layout, w, h, BoxPreference::Below, BoxAlign::Right);
        self.rects.stats = self.text_box(canvas, x, y, &refs, pad, TEXT_BG);
    }

    /// Full redraw: text box, plot, label, stats footer
    pub fn draw(&mut self, canvas: &mut Canvas, frame: &Frame, plot: &mut RollingPlot) {
        self.draw_text_box(canvas, frame.lines);
        self.draw_plot(canvas, plot, frame.unit);
        self.draw_label(canvas, frame.label);
        self.draw_stats(canvas, plot, frame);
    }
}

/// Footer text under the plot
pub fn footer_lines(plot: &RollingPlot, frame: &Frame) -> Vec<String> {
    match (plot.latest(), plot.avg(), plot.min(), plot.max()) {
        (Some(latest), Some(avg), Some(min), Some(max)) => vec![
            format!("NOW {:.2} {}", latest, frame.unit),
            format!("AVG {:.2} MIN {:.2} MAX {:.2}", avg, min, max),
        ],
        _ if !frame.have_stats => vec!["Waiting for stats...".to_string()],
        _ => vec!["Collecting samples...".to_string()],
    }
}
