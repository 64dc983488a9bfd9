use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Work allowance for one streaming update.
///
/// Activation spends one unit after each step (or each component batch).
/// Work stops, and resumes on a later tick, once the budget is exhausted.
#[derive(Debug, Clone, Copy)]
pub enum TickBudget {
    Unlimited,
    Steps { remaining: u32 },
    Time { start: Instant, limit: Duration },
}

impl TickBudget {
    pub fn unlimited() -> Self {
        Self::Unlimited
    }

    pub fn steps(count: u32) -> Self {
        Self::Steps { remaining: count }
    }

    /// Time budget starting now.
    pub fn time_limit(limit: Duration) -> Self {
        Self::Time {
            start: Instant::now(),
            limit,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    pub fn is_exhausted(&self) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Steps { remaining } => *remaining == 0,
            Self::Time { start, limit } => start.elapsed() >= *limit,
        }
    }

    /// Account for one unit of work. Returns `true` when nothing is left.
    pub fn spend(&mut self) -> bool {
        if let Self::Steps { remaining } = self {
            *remaining = remaining.saturating_sub(1);
        }
        self.is_exhausted()
    }
}

/// Per-tick streaming statistics for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub loads_issued: usize,
    pub loads_failed: usize,
    pub levels_shown: usize,
    pub levels_hidden: usize,
    pub unloads_requested: usize,
    pub levels_collected: usize,
    pub activation_steps: usize,
    pub total_records: usize,
    pub tick_time: Duration,
}

/// Rolling window of tick durations.
#[derive(Debug)]
pub struct TickTimer {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, dt: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(dt);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.samples.iter().copied().min().unwrap_or(Duration::ZERO)
    }
}
