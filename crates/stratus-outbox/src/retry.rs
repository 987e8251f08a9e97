// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy for failed publish attempts.
//!
//! A failed attempt increments `retry_count`. While the count stays below
//! `max_retries` the event goes back to `pending` with `available_at` pushed
//! into the future by an exponential backoff; once the count reaches
//! `max_retries` the event is dead-lettered as `failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Largest exponent applied to the base backoff.
const MAX_BACKOFF_EXPONENT: i32 = 30;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an event is dead-lettered.
    pub max_retries: i32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry limit and default backoff.
    pub fn with_max_retries(max_retries: i32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Policy that makes retried events eligible again immediately.
    pub fn immediate(max_retries: i32) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the event becomes claimable again after its
    /// `retry_count`-th failure (1-based).
    pub fn backoff_for(&self, retry_count: i32) -> Duration {
        let exponent = (retry_count.max(1) - 1).min(MAX_BACKOFF_EXPONENT) as u32;
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether `retry_count` failures exhaust the policy.
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

/// What happened to an event after a failed publish was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in `pending`, claimable from `available_at`.
    Retrying {
        /// Failed attempts so far.
        retry_count: i32,
        /// When the event becomes claimable again.
        available_at: DateTime<Utc>,
    },
    /// Moved to `failed`.
    DeadLettered {
        /// Failed attempts so far.
        retry_count: i32,
    },
}

impl FailureOutcome {
    /// Failed attempts recorded for the event.
    pub fn retry_count(&self) -> i32 {
        match self {
            Self::Retrying { retry_count, .. } | Self::DeadLettered { retry_count } => *retry_count,
        }
    }

    /// Whether the event was dead-lettered.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered { .. })
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
