use std::{collections::VecDeque, time::Duration};

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Counters {
    pub downloaded: u64,
    pub uploaded: u64,
}

impl Counters {
    pub fn new(downloaded: u64, uploaded: u64) -> Self {
        Self {
            downloaded,
            uploaded,
        }
    }
}

/// Ring of per-sample transfer deltas. One sample is taken every tick;
/// speeds are averaged over the whole window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// Contains data that represents how difference between two measurements changed
    history: VecDeque<Counters>,
    /// Snapshot of latest measurements, used to calculate new deltas
    snapshot: Counters,
}

impl RateWindow {
    const MAX_CAPACITY: usize = 20;

    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(Self::MAX_CAPACITY),
            snapshot: Counters::default(),
        }
    }

    pub fn sample(&mut self, new: Counters) {
        if self.history.len() == Self::MAX_CAPACITY {
            self.history.pop_back();
        }
        let delta = Counters::new(
            new.downloaded - self.snapshot.downloaded,
            new.uploaded - self.snapshot.uploaded,
        );
        self.snapshot = new;
        self.history.push_front(delta);
    }

    /// Average downloaded bytes per sample
    pub fn avg_down(&self) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        self.history.iter().map(|m| m.downloaded).sum::<u64>() / self.history.len() as u64
    }

    /// Average uploaded bytes per sample
    pub fn avg_up(&self) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        self.history.iter().map(|m| m.uploaded).sum::<u64>() / self.history.len() as u64
    }

    pub fn down_speed_sec(&self, tick_duration: Duration) -> u64 {
        (self.avg_down() as f32 / tick_duration.as_secs_f32()) as u64
    }

    pub fn up_speed_sec(&self, tick_duration: Duration) -> u64 {
        (self.avg_up() as f32 / tick_duration.as_secs_f32()) as u64
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Request pipeline sizing from the observed download rate.
/// `W = clamp(rate / block_size, min, max)`
pub fn pipeline_depth(down_speed_sec: u64, block_size: u32, min: usize, max: usize) -> usize {
    let by_rate = (down_speed_sec / block_size as u64) as usize;
    by_rate.clamp(min, max)
}

/// Engine wide transfer totals, sampled on the tick task only
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    totals: Counters,
    window: RateWindow,
}

impl BandwidthTracker {
    pub fn add_downloaded(&mut self, bytes: u64) {
        self.totals.downloaded += bytes;
    }

    pub fn add_uploaded(&mut self, bytes: u64) {
        self.totals.uploaded += bytes;
    }

    pub fn totals(&self) -> Counters {
        self.totals
    }

    /// Called once per tick
    pub fn sample(&mut self) {
        self.window.sample(self.totals);
    }

    pub fn down_speed_sec(&self, tick_duration: Duration) -> u64 {
        self.window.down_speed_sec(tick_duration)
    }

    pub fn up_speed_sec(&self, tick_duration: Duration) -> u64 {
        self.window.up_speed_sec(tick_duration)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn rate_window_averages_deltas() {
        let mut window = RateWindow::new();
        window.sample(Counters::new(100, 0));
        window.sample(Counters::new(300, 50));
        window.sample(Counters::new(600, 50));
        // deltas are 100, 200, 300
        assert_eq!(window.avg_down(), 200);
        assert_eq!(window.avg_up(), 16);
        assert_eq!(window.down_speed_sec(Duration::from_millis(200)), 1000);
    }

    #[test]
    fn rate_window_caps_history() {
        let mut window = RateWindow::new();
        for i in 0..100u64 {
            window.sample(Counters::new(i * 10, 0));
        }
        assert_eq!(window.avg_down(), 10);
    }

    #[test]
    fn pipeline_depth_clamps() {
        assert_eq!(pipeline_depth(0, 16384, 8, 80), 8);
        assert_eq!(pipeline_depth(16384 * 40, 16384, 8, 80), 40);
        assert_eq!(pipeline_depth(u64::MAX / 2, 16384, 8, 80), 80);
    }
}
