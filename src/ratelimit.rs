//! Rate-limited, single-flight call executor.
//!
//! Every outbound platform call goes through [`CallExecutor::execute`] with a
//! route key. Calls on the same route run one at a time, in arrival order
//! (the route slot is a fair `tokio::sync::Mutex`). Rate-limit responses park
//! either the route or every route until the limit expires.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{Instant, sleep, sleep_until};

use crate::antinuke::platform::PlatformError;

/// Waiter depth per route above which we start complaining in logs.
const WAITER_WARN_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub retry_limit: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryOptions {
    pub fn with_limit(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            ..Self::default()
        }
    }

    /// `min(max, initial * 2^attempt)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
struct Route {
    slot: tokio::sync::Mutex<()>,
    limited_until: Mutex<Option<Instant>>,
    waiting: AtomicUsize,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutorStats {
    pub routes: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub limited_routes: usize,
    pub global_limited: bool,
}

#[derive(Debug, Default)]
pub struct CallExecutor {
    routes: DashMap<String, Arc<Route>>,
    global_until: Mutex<Option<Instant>>,
}

impl CallExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, key: &str) -> Arc<Route> {
        if let Some(r) = self.routes.get(key) {
            return r.clone();
        }
        self.routes.entry(key.to_string()).or_default().clone()
    }

    /// Runs `f` on `route`, retrying per `opts`.
    ///
    /// Rate-limit errors set the global or route limit and consume a retry.
    /// Transport errors back off exponentially. Refusals (not found, forbidden,
    /// unauthorized, unsupported) are returned immediately since retrying
    /// cannot change them. When retries run out the last error is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        route: &str,
        opts: &RetryOptions,
        mut f: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let r = self.route(route);

        let depth = r.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        let waiting = WaitGuard(&r.waiting);
        if depth > WAITER_WARN_DEPTH {
            tracing::warn!(route, depth, "route queue is deep");
        }
        let _slot = r.slot.lock().await;
        drop(waiting);

        let mut attempt = 0u32;
        loop {
            self.wait_for_limits(&r).await;

            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            match &err {
                PlatformError::RateLimited {
                    retry_after,
                    global,
                } => {
                    let until = Instant::now() + *retry_after;
                    if *global {
                        set_until(&self.global_until, until);
                    } else {
                        set_until(&r.limited_until, until);
                    }
                    tracing::warn!(route, retry_after=?retry_after, global, attempt, "rate limited");
                    if attempt >= opts.retry_limit {
                        return Err(err);
                    }
                }
                PlatformError::Transport(msg) => {
                    if attempt >= opts.retry_limit {
                        tracing::warn!(route, error=%msg, attempt, "retries exhausted");
                        return Err(err);
                    }
                    let delay = opts.backoff(attempt);
                    tracing::debug!(route, error=%msg, delay=?delay, "retrying after backoff");
                    sleep(delay).await;
                }
                _ => return Err(err),
            }
            attempt += 1;
        }
    }

    async fn wait_for_limits(&self, route: &Route) {
        loop {
            let now = Instant::now();
            let until = [read_until(&self.global_until), read_until(&route.limited_until)]
                .into_iter()
                .flatten()
                .filter(|t| *t > now)
                .max();
            match until {
                Some(t) => sleep_until(t).await,
                None => return,
            }
        }
    }

    /// Drops routes with nothing in flight or queued and no live limit.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.routes.len();
        // anyone holding a clone is running or queued on the route
        self.routes.retain(|_, r| {
            Arc::strong_count(r) > 1 || read_until(&r.limited_until).is_some_and(|t| t > now)
        });
        before.saturating_sub(self.routes.len())
    }

    pub fn spawn_prune_task(this: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    let n = strong.prune_idle();
                    if n > 0 {
                        tracing::debug!(removed = n, "idle routes pruned");
                    }
                } else {
                    break;
                }
            }
        });
    }

    pub fn stats(&self) -> ExecutorStats {
        let now = Instant::now();
        let mut stats = ExecutorStats {
            routes: self.routes.len(),
            in_flight: 0,
            waiting: 0,
            limited_routes: 0,
            global_limited: read_until(&self.global_until).is_some_and(|t| t > now),
        };
        for r in self.routes.iter() {
            if r.slot.try_lock().is_err() {
                stats.in_flight += 1;
            }
            stats.waiting += r.waiting.load(Ordering::SeqCst);
            if read_until(&r.limited_until).is_some_and(|t| t > now) {
                stats.limited_routes += 1;
            }
        }
        stats
    }
}

fn read_until(m: &Mutex<Option<Instant>>) -> Option<Instant> {
    *m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_until(m: &Mutex<Option<Instant>>, until: Instant) {
    let mut g = m.lock().unwrap_or_else(PoisonError::into_inner);
    if g.is_none_or(|cur| cur < until) {
        *g = Some(until);
    }
}
