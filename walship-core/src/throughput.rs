// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Throughput measurement and rate limiting for bulk transfers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Moving-average throughput over a sliding window of roughly one second.
///
/// Samples closer together than [`Self::INTERVAL`] are merged; samples older
/// than [`Self::MAX_WINDOW`] are dropped once the window exceeds
/// [`Self::MIN_WINDOW`].
pub struct ThroughputMonitor {
    progress_lb: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMonitor {
    const INTERVAL: Duration = Duration::from_millis(10);
    const MIN_WINDOW: Duration = Duration::from_millis(900);
    const MAX_WINDOW: Duration = Duration::from_millis(1100);

    pub fn new() -> Self {
        Self {
            progress_lb: 0,
            samples: VecDeque::new(),
        }
    }

    /// Record `size_lb` of progress and return the current rate
    /// [logical blocks per second].
    pub fn add_and_get_lb_per_sec(&mut self, size_lb: u64) -> u64 {
        self.progress_lb += size_lb;
        let now = Instant::now();
        match self.samples.back() {
            Some((t, _)) if now.duration_since(*t) <= Self::INTERVAL => {}
            _ => self.samples.push_back((now, self.progress_lb)),
        }
        self.gc(now);
        self.rate(now)
    }

    pub fn lb_per_sec(&mut self) -> u64 {
        let now = Instant::now();
        self.gc(now);
        self.rate(now)
    }

    fn gc(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > Self::MAX_WINDOW
                && self
                    .samples
                    .get(1)
                    .map(|(t1, _)| now.duration_since(*t1) >= Self::MIN_WINDOW)
                    .unwrap_or(false)
            {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self, now: Instant) -> u64 {
        let Some((t0, p0)) = self.samples.front() else {
            return 0;
        };
        let ms = now.duration_since(*t0).as_millis() as u64;
        if ms == 0 {
            return 0;
        }
        (self.progress_lb - p0) * 1000 / ms
    }
}

impl Default for ThroughputMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps in short increments until the measured rate drops below a cap.
pub struct ThroughputStabilizer {
    max_lb_per_sec: u64,
    monitor: ThroughputMonitor,
}

impl ThroughputStabilizer {
    /// `max_lb_per_sec == 0` disables throttling.
    pub fn new(max_lb_per_sec: u64) -> Self {
        Self {
            max_lb_per_sec,
            monitor: ThroughputMonitor::new(),
        }
    }

    pub fn add_and_sleep_if_necessary(
        &mut self,
        size_lb: u64,
        sleep: Duration,
        max_sleep: Duration,
    ) {
        if self.max_lb_per_sec == 0 {
            return;
        }
        let mut rate = self.monitor.add_and_get_lb_per_sec(size_lb);
        let mut total = Duration::ZERO;
        while rate > self.max_lb_per_sec && total < max_sleep {
            std::thread::sleep(sleep);
            total += sleep;
            rate = self.monitor.lb_per_sec();
        }
    }
}
