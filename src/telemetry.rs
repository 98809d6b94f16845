use std::collections::VecDeque;

const LATENCY_WINDOW: usize = 10;

/// Rolling round-trip window over the last ten heartbeat samples.
#[derive(Debug, Default, Clone)]
pub struct LatencyMeter {
    samples: VecDeque<u64>,
}

impl LatencyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample and returns the floored mean of the window.
    pub fn push(&mut self, sample_ms: u64) -> u64 {
        self.samples.push_back(sample_ms);
        if self.samples.len() > LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.mean()
    }

    pub fn mean(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
