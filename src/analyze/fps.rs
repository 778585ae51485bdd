//! Frames-per-second over fixed one-second windows of the trace clock.

use std::collections::HashSet;

use serde::Serialize;

/// Window length in nanoseconds.
pub const FPS_WINDOW_NS: i64 = 1_000_000_000;

/// Windows below this rate count as low-FPS.
pub const LOW_FPS_THRESHOLD: f64 = 45.0;

/// Shortest duration a trailing partial window is given, so a window
/// holding a single zero-length frame still has a finite rate.
const MIN_PARTIAL_WINDOW_NS: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FpsWindow {
    /// Seconds since the first frame.
    pub start_time: f64,
    pub end_time: f64,
    pub start_time_ts: i64,
    pub end_time_ts: i64,
    pub frame_count: u64,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FpsStats {
    pub average_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub low_fps_window_count: u64,
    pub low_fps_threshold: f64,
    pub fps_windows: Vec<FpsWindow>,
}

impl Default for FpsStats {
    fn default() -> Self {
        Self {
            average_fps: 0.0,
            min_fps: 0.0,
            max_fps: 0.0,
            low_fps_window_count: 0,
            low_fps_threshold: LOW_FPS_THRESHOLD,
            fps_windows: Vec::new(),
        }
    }
}

/// Streaming window counter. Feed frames with [`record`](Self::record) in
/// iteration order, then call [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct FpsTracker {
    first_ts: Option<i64>,
    window_start: i64,
    window_end: i64,
    frame_count: u64,
    /// Latest `ts + dur` among frames counted in the open window.
    last_frame_end: i64,
    seen: HashSet<(i64, i64)>,
    windows: Vec<FpsWindow>,
}

impl FpsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, vsync: i64, ts: i64, dur: i64) {
        let first_ts = match self.first_ts {
            Some(first_ts) => first_ts,
            None => {
                self.first_ts = Some(ts);
                self.window_start = ts;
                self.window_end = ts + FPS_WINDOW_NS;
                self.last_frame_end = ts;
                ts
            }
        };

        while ts >= self.window_end {
            let end = self.window_end;
            self.close_window(first_ts, end);
            self.window_start = end;
            self.window_end = end + FPS_WINDOW_NS;
        }

        // Frames that arrive out of trace order and fall before the open
        // window are not counted.
        if ts >= self.window_start && self.seen.insert((vsync, ts)) {
            self.frame_count += 1;
            self.last_frame_end = self.last_frame_end.max(ts + dur.max(0));
        }
    }

    fn close_window(&mut self, first_ts: i64, end: i64) {
        let duration_ms = (end - self.window_start) as f64 / 1_000_000.0;
        let fps = if duration_ms > 0.0 {
            self.frame_count as f64 / duration_ms * 1000.0
        } else {
            0.0
        };
        self.windows.push(FpsWindow {
            start_time: (self.window_start - first_ts) as f64 / 1e9,
            end_time: (end - first_ts) as f64 / 1e9,
            start_time_ts: self.window_start,
            end_time_ts: end,
            frame_count: self.frame_count,
            fps,
        });
        self.frame_count = 0;
        self.last_frame_end = end;
    }

    /// Close the trailing window and compute the aggregate statistics.
    ///
    /// The trailing window ends where its last frame ends rather than a full
    /// second later, so a short capture is not reported at a fraction of its
    /// real rate.
    pub fn finish(mut self) -> FpsStats {
        let Some(first_ts) = self.first_ts else {
            return FpsStats::default();
        };
        if self.frame_count > 0 {
            let end = self
                .last_frame_end
                .clamp(self.window_start + MIN_PARTIAL_WINDOW_NS, self.window_end);
            self.close_window(first_ts, end);
        }
        if self.windows.is_empty() {
            return FpsStats::default();
        }

        let rates: Vec<f64> = self.windows.iter().map(|w| w.fps).collect();
        let average_fps = rates.iter().sum::<f64>() / rates.len() as f64;
        let min_fps = rates.iter().copied().fold(f64::INFINITY, f64::min);
        let max_fps = rates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let low_fps_window_count = rates.iter().filter(|&&r| r < LOW_FPS_THRESHOLD).count() as u64;

        FpsStats {
            average_fps,
            min_fps,
            max_fps,
            low_fps_window_count,
            low_fps_threshold: LOW_FPS_THRESHOLD,
            fps_windows: self.windows,
        }
    }
}
