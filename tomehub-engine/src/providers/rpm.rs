//! Process-wide sliding-window RPM limiter for the primary explorer model.
//!
//! Entering the limiter is the only synchronous point in the otherwise
//! lock-free LLM orchestration.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

pub struct RpmWindow {
    cap: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RpmWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to consume one request slot; `false` means the window is full.
    pub fn try_consume(&self) -> bool {
        if self.cap == 0 {
            return false;
        }
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().expect("RpmWindow lock poisoned");
        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            timestamps.pop_front();
        }
        if timestamps.len() >= self.cap {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().expect("RpmWindow lock poisoned");
        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            timestamps.pop_front();
        }
        timestamps.len()
    }
}
