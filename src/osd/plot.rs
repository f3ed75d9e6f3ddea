//! Episodic rolling plot
//!
//! Samples fill the buffer left to right. When it is full the next sample starts
//! a fresh episode: the plot clears and its running statistics restart.

use std::time::Duration;

pub const MIN_CAPACITY: usize = 2;
pub const MAX_CAPACITY: usize = 1024;

/// `ceil(window / refresh)`, clamped to the supported capacity range
pub fn capacity_for(window: Duration, refresh: Duration) -> usize {
    let refresh_ms = refresh.as_millis().max(1);
    let cap = window.as_millis().div_ceil(refresh_ms) as usize;
    cap.clamp(MIN_CAPACITY, MAX_CAPACITY)
}

#[derive(Debug, Clone)]
pub struct RollingPlot {
    samples: Vec<f64>,
    cursor: usize,
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
    latest: f64,
    window: Duration,
    clear_on_next_draw: bool,
}

impl RollingPlot {
    pub fn new(window: Duration, refresh: Duration) -> Self {
        let capacity = capacity_for(window, refresh);
        Self {
            samples: vec![0.0; capacity],
            cursor: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: 0.0,
            latest: 0.0,
            window,
            clear_on_next_draw: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Live samples in draw order
    pub fn samples(&self) -> &[f64] {
        &self.samples[..self.count]
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.min.is_finite().then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn latest(&self) -> Option<f64> {
        (self.count > 0).then_some(self.latest)
    }

    fn reset_stats(&mut self) {
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = 0.0;
        self.latest = 0.0;
    }

    pub fn push(&mut self, value: f64) {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        let capacity = self.capacity();
        if self.cursor >= capacity {
            self.cursor = 0;
        }
        if self.cursor == 0 && self.count >= capacity {
            self.reset_stats();
            self.clear_on_next_draw = true;
        }

        self.samples[self.cursor] = value;
        self.cursor += 1;
        self.count = self.count.max(self.cursor);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.latest = value;
    }

    /// Whether the plot area must be wiped before drawing; reading clears the flag
    pub fn take_clear(&mut self) -> bool {
        std::mem::take(&mut self.clear_on_next_draw)
    }

    /// Vertical scale: max plus 10% headroom, at least 0.05
    pub fn scale(&self) -> f64 {
        let max = if self.max <= 0.0 { 1.0 } else { self.max };
        max + (max * 0.1).max(0.05)
    }

    /// Screen row for `value` inside a plot `h` pixels tall starting at `y`
    pub fn value_to_y(&self, value: f64, y: i32, h: i32) -> i32 {
        let norm = (value / self.scale()).clamp(0.0, 1.0);
        y + h - 1 - (norm * (h - 1) as f64).round() as i32
    }

    /// Horizontal distance between consecutive samples in a plot `w` pixels wide
    pub fn step(&self, w: i32) -> f64 {
        (w - 1).max(0) as f64 / (self.capacity() - 1) as f64
    }
}
