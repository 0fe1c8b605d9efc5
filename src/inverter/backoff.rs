//! Per-query backoff: whether a poll code goes out in the current cycle.
//!
//! Every polled code carries a [`QueryBackoff`] from the field table. The
//! driver keeps one [`QueryTracker`] per code, feeds it answers and misses,
//! and resets all of them when the link is torn down.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryBackoff {
    /// Every cycle.
    Always,
    /// Until answered once, then not again before the next connection.
    Once,
    /// At most once per `interval_ms` after an answer.
    Timed { interval_ms: u64 },
    /// Dropped after `retries` unanswered tries, until the next connection.
    /// One answer marks the code supported for the rest of the connection.
    IfSupported { retries: u8 },
}

impl QueryBackoff {
    fn initial_tries(self) -> u8 {
        match self {
            QueryBackoff::IfSupported { retries } => retries,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTracker {
    code: &'static str,
    backoff: QueryBackoff,
    answered: bool,
    last_answer_ms: Option<u64>,
    tries_left: u8,
}

impl QueryTracker {
    pub fn new(code: &'static str, backoff: QueryBackoff) -> Self {
        Self {
            code,
            backoff,
            answered: false,
            last_answer_ms: None,
            tries_left: backoff.initial_tries(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn backoff(&self) -> QueryBackoff {
        self.backoff
    }

    /// Should the code be queued for a cycle starting at `now_ms`?
    pub fn consider(&self, now_ms: u64) -> bool {
        match self.backoff {
            QueryBackoff::Always => true,
            QueryBackoff::Once => !self.answered,
            QueryBackoff::Timed { interval_ms } => match self.last_answer_ms {
                Some(last) => now_ms.saturating_sub(last) >= interval_ms,
                None => true,
            },
            QueryBackoff::IfSupported { .. } => self.answered || self.tries_left > 0,
        }
    }

    pub fn record_answer(&mut self, now_ms: u64) {
        self.answered = true;
        self.last_answer_ms = Some(now_ms);
    }

    /// Count a reply that left the code out. Returns `true` when this miss
    /// is the one that makes the code drop out.
    pub fn record_miss(&mut self) -> bool {
        if !matches!(self.backoff, QueryBackoff::IfSupported { .. }) || self.answered || self.tries_left == 0 {
            return false;
        }
        self.tries_left -= 1;
        self.tries_left == 0
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.code, self.backoff);
    }
}
