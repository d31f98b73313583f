// src/pagination.rs
//! Viewport-fill ("load more") gate.
//!
//! A caller that keeps seeing the end of its list may pull further pages on its own,
//! but only while nothing is loading, more pages exist, and the last fetch is older
//! than `min_interval`. At most `max_consecutive_iterations` automatic fetches happen
//! per user trigger; [`AutoFill::user_trigger`] resets the count.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Anything that knows whether a further page exists.
pub trait Paged {
    fn has_more(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoFillPolicy {
    pub min_interval: Duration,
    pub max_consecutive_iterations: u32,
}

/// Pure gate: may an automatic fetch start now?
pub fn should_fetch(
    loading: bool,
    has_more: bool,
    since_last_fetch: Option<Duration>,
    iterations: u32,
    policy: &AutoFillPolicy,
) -> bool {
    !loading
        && has_more
        && iterations < policy.max_consecutive_iterations
        && since_last_fetch.map_or(true, |e| e > policy.min_interval)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    NotNearEnd,
    Loading,
    Exhausted,
    IterationCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDecision {
    Fetch,
    /// Too soon after the last fetch; retry after this long.
    Wait(Duration),
    Halt(HaltReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    pub fetched: u32,
    pub halted: HaltReason,
}

/// Per-list auto-fill state.
#[derive(Debug, Clone)]
pub struct AutoFill {
    policy: AutoFillPolicy,
    loading: bool,
    iterations: u32,
    last_fetch: Option<Instant>,
}

impl AutoFill {
    pub fn new(policy: AutoFillPolicy) -> Self {
        Self {
            policy,
            loading: false,
            iterations: 0,
            last_fetch: None,
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// A user-driven trigger (scroll, click) starts a fresh run of automatic fetches.
    pub fn user_trigger(&mut self) {
        self.iterations = 0;
    }

    pub fn decide(&self, has_more: bool, now: Instant) -> FillDecision {
        let since = self.last_fetch.map(|t| now.saturating_duration_since(t));
        if should_fetch(self.loading, has_more, since, self.iterations, &self.policy) {
            return FillDecision::Fetch;
        }
        if self.loading {
            FillDecision::Halt(HaltReason::Loading)
        } else if !has_more {
            FillDecision::Halt(HaltReason::Exhausted)
        } else if self.iterations >= self.policy.max_consecutive_iterations {
            FillDecision::Halt(HaltReason::IterationCap)
        } else {
            // Only the interval is left; wait until it has strictly passed.
            let since = since.unwrap_or_default();
            FillDecision::Wait(
                self.policy.min_interval.saturating_sub(since) + Duration::from_millis(1),
            )
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.loading = true;
        self.iterations += 1;
        self.last_fetch = Some(now);
    }

    pub fn finish(&mut self) {
        self.loading = false;
    }
}

/// Run automatic fetches while `near_end` holds and the gate allows it.
///
/// `fetch` receives the current state and returns the state after one more page.
/// Throttled iterations sleep until the interval has passed.
pub async fn drive<S, N, F, Fut>(
    fill: &mut AutoFill,
    mut state: S,
    mut near_end: N,
    mut fetch: F,
) -> (S, FillReport)
where
    S: Paged,
    N: FnMut(&S) -> bool,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = S>,
{
    let mut fetched = 0u32;
    let halted = loop {
        if !near_end(&state) {
            break HaltReason::NotNearEnd;
        }
        match fill.decide(state.has_more(), Instant::now()) {
            FillDecision::Fetch => {
                fill.begin(Instant::now());
                state = fetch(state).await;
                fill.finish();
                fetched += 1;
            }
            FillDecision::Wait(d) => tokio::time::sleep(d).await,
            FillDecision::Halt(r) => break r,
        }
    };
    tracing::debug!(fetched, halted = ?halted, "auto-fill stopped");
    (state, FillReport { fetched, halted })
}
