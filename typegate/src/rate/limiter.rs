use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::RateLimited;
use crate::json_ext::ValueExt;
use crate::typegraph::RateConfig;
use crate::Context;

const ANONYMOUS: &str = "anonymous";

/// A fixed window of one partition. The start and the counter live under
/// the same lock so a reset and a concurrent admission cannot interleave.
#[derive(Debug, Default)]
struct Window {
    /// Start of the window, in milliseconds since the epoch.
    start: u64,
    consumed: u64,
}

impl Window {
    /// Starts a new window at `now` once `length` has elapsed.
    fn roll(&mut self, now: u64, length: u64) {
        if now.saturating_sub(self.start) >= length {
            self.start = now;
            self.consumed = 0;
        }
    }
}

/// Per partition weight counters of one typegraph.
#[derive(Debug)]
pub struct RateLimiterState {
    config: RateConfig,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl RateLimiterState {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// The partition a query is counted in: the configured claim, then the
    /// client address.
    pub fn partition_key(&self, context: &Context) -> String {
        self.config
            .context_identifier
            .as_deref()
            .and_then(|path| context.claim(path))
            .map(|value| value.to_plain_string())
            .or_else(|| context.client_addr().map(str::to_string))
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Admits a query of weight `weight` or rejects it without consuming
    /// anything.
    pub fn acquire(&self, key: &str, weight: u64) -> Result<(), RateLimited> {
        self.acquire_at(key, weight, now_millis())
    }

    pub(crate) fn acquire_at(&self, key: &str, weight: u64, now: u64) -> Result<(), RateLimited> {
        if weight > self.config.query_limit {
            tracing::debug!(key, weight, limit = self.config.query_limit, "query too heavy");
            return Err(RateLimited::new());
        }
        let window = self.window(key, now);
        let mut window = window.lock();
        window.roll(now, self.window_length());
        let budget = self.config.window_limit + self.config.local_excess;
        match window.consumed.checked_add(weight) {
            Some(total) if total <= budget => {
                window.consumed = total;
                Ok(())
            }
            _ => {
                tracing::debug!(
                    key,
                    weight,
                    consumed = window.consumed,
                    budget,
                    "rate limit exceeded"
                );
                Err(RateLimited::new())
            }
        }
    }

    /// Adds weight discovered after execution. Never rejects: the query has
    /// already run, the next one pays for it.
    pub fn charge(&self, key: &str, weight: u64) {
        self.charge_at(key, weight, now_millis())
    }

    pub(crate) fn charge_at(&self, key: &str, weight: u64, now: u64) {
        if weight == 0 {
            return;
        }
        let window = self.window(key, now);
        let mut window = window.lock();
        window.roll(now, self.window_length());
        window.consumed = window.consumed.saturating_add(weight);
    }

    /// Weight consumed by a partition in its current window.
    pub fn consumed(&self, key: &str) -> u64 {
        self.windows
            .get(key)
            .map(|window| window.lock().consumed)
            .unwrap_or_default()
    }

    fn window_length(&self) -> u64 {
        self.config.window_sec.saturating_mul(1000)
    }

    fn window(&self, key: &str, now: u64) -> Arc<Mutex<Window>> {
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Window {
                    start: now,
                    consumed: 0,
                }))
            })
            .clone()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
