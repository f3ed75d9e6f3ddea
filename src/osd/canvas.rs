//! Clipped ARGB8888 raster primitives over a mapped framebuffer

use super::font::{self, GLYPH_ADVANCE, GLYPH_SIZE};

/// Axis-aligned rectangle in canvas pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Borrowed view of an ARGB8888 pixel buffer
pub struct Canvas<'a> {
    buf: &'a mut [u8],
    width: i32,
    height: i32,
    stride: usize,
}

impl<'a> Canvas<'a> {
    /// `stride` is the row pitch in bytes
    ///
    /// The visible height is trimmed if the buffer is shorter than `height` rows.
    pub fn new(buf: &'a mut [u8], width: u32, height: u32, stride: u32) -> Self {
        let stride = (stride as usize).max(width as usize * 4);
        let rows = if stride == 0 { 0 } else { buf.len() / stride };
        Self {
            buf,
            width: width as i32,
            height: (height as usize).min(rows) as i32,
            stride,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Clip to the canvas; `None` if nothing is left
    fn clip(&self, r: Rect) -> Option<Rect> {
        let x0 = r.x.max(0);
        let y0 = r.y.max(0);
        let x1 = r.right().min(self.width);
        let y1 = r.bottom().min(self.height);
        (x1 > x0 && y1 > y0).then(|| Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Pixel value at (x, y), if on the canvas
    pub fn get(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        let off = y as usize * self.stride + x as usize * 4;
        let px: [u8; 4] = self.buf[off..off + 4].try_into().ok()?;
        Some(u32::from_le_bytes(px))
    }

    pub fn fill_rect(&mut self, r: Rect, argb: u32) {
        let Some(r) = self.clip(r) else {
            return;
        };
        let bytes = argb.to_le_bytes();
        for y in r.y..r.bottom() {
            let row = y as usize * self.stride;
            let start = row + r.x as usize * 4;
            let end = row + r.right() as usize * 4;
            for px in self.buf[start..end].chunks_exact_mut(4) {
                px.copy_from_slice(&bytes);
            }
        }
    }

    pub fn clear(&mut self, argb: u32) {
        self.fill_rect(self.bounds(), argb);
    }

    /// Horizontal run of `len` pixels, `thickness` rows tall
    pub fn hline(&mut self, x: i32, y: i32, len: i32, thickness: i32, argb: u32) {
        self.fill_rect(Rect::new(x, y, len, thickness.max(1)), argb);
    }

    /// Vertical run of `len` pixels, `thickness` columns wide
    pub fn vline(&mut self, x: i32, y: i32, len: i32, thickness: i32, argb: u32) {
        self.fill_rect(Rect::new(x, y, thickness.max(1), len), argb);
    }

    /// Border of `thickness` pixels drawn inside `r`
    pub fn rect_outline(&mut self, r: Rect, thickness: i32, argb: u32) {
        if r.is_empty() {
            return;
        }
        let t = thickness.max(1).min(r.w).min(r.h);
        self.hline(r.x, r.y, r.w, t, argb);
        self.hline(r.x, r.bottom() - t, r.w, t, argb);
        self.vline(r.x, r.y, r.h, t, argb);
        self.vline(r.right() - t, r.y, r.h, t, argb);
    }

    /// Bresenham line stamping a `thickness`-sized block at every step
    pub fn line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, thickness: i32, argb: u32) {
        let t = thickness.max(1);
        let half = t / 2;
        let (mut x, mut y) = (x0, y0);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.fill_rect(Rect::new(x - half, y - half, t, t), argb);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// One glyph with every font pixel blown up to `scale`x`scale`
    pub fn draw_char(&mut self, x: i32, y: i32, c: char, argb: u32, scale: i32) {
        let scale = scale.max(1);
        let glyph = font::glyph(c);
        for row in 0..GLYPH_SIZE {
            if glyph[row as usize] == 0 {
                continue;
            }
            for col in 0..GLYPH_SIZE {
                if font::pixel(glyph, col, row) {
                    self.fill_rect(
                        Rect::new(x + col as i32 * scale, y + row as i32 * scale, scale, scale),
                        argb,
                    );
                }
            }
        }
    }

    /// Text starting at (x, y); `\n` starts a new line
    pub fn draw_text(&mut self, x: i32, y: i32, text: &str, argb: u32, scale: i32) {
        let advance = GLYPH_ADVANCE as i32 * scale.max(1);
        let (mut cx, mut cy) = (x, y);
        for c in text.chars() {
            if c == '\n' {
                cx = x;
                cy += advance;
                continue;
            }
            self.draw_char(cx, cy, c, argb, scale);
            cx += advance;
        }
    }
}

/// Pixel extent of `text` at `scale`: widest line by number of lines
pub fn text_size(text: &str, scale: i32) -> (i32, i32) {
    let advance = GLYPH_ADVANCE as i32 * scale.max(1);
    let lines = text.split('\n');
    let (mut widest, mut count) = (0, 0);
    for line in lines {
        widest = widest.max(line.chars().count() as i32);
        count += 1;
    }
    (widest * advance, count * advance)
}
