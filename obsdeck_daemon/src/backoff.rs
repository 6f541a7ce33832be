use rand::{thread_rng, Rng};
use std::time::Duration;

pub const DEFAULT_TABLE_MS: &[u64] = &[250, 500, 750];
pub const DEFAULT_EXHAUSTED_MS: u64 = 10_000;
pub const DEFAULT_JITTER_PERCENT: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retry after the given (jittered) delay.
    After(Duration),
    /// The table ran out. Retry after the long delay; the next failure starts
    /// the table over.
    Exhausted(Duration),
}

/// Bounded table of increasing reconnect delays with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    table: Vec<Duration>,
    exhausted: Duration,
    jitter_percent: u8,
    attempt: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_TABLE_MS.iter().map(|&ms| Duration::from_millis(ms)).collect(),
            Duration::from_millis(DEFAULT_EXHAUSTED_MS),
            DEFAULT_JITTER_PERCENT,
        )
    }
}

impl Backoff {
    pub fn new(table: Vec<Duration>, exhausted: Duration, jitter_percent: u8) -> Self {
        Self {
            table,
            exhausted,
            jitter_percent: jitter_percent.min(100),
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Retry {
        match self.table.get(self.attempt).copied() {
            Some(base) => {
                self.attempt += 1;
                Retry::After(self.jitter(base))
            }
            None => {
                self.attempt = 0;
                Retry::Exhausted(self.exhausted)
            }
        }
    }

    fn jitter(&self, base: Duration) -> Duration {
        let base_ms = base.as_millis() as u64;
        let max_extra = base_ms * u64::from(self.jitter_percent) / 100;
        if max_extra == 0 {
            return base;
        }
        Duration::from_millis(base_ms + thread_rng().gen_range(0..=max_extra))
    }
}
