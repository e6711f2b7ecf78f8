//! Outbound request admission control.
//!
//! Tracks two sliding one-minute windows (request weight and order count)
//! against the venue quotas, reserves a slice of the budget for critical
//! traffic, and absorbs 429/418 responses. Purely an admission controller:
//! no I/O happens here and nothing is retried internally.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Raw venue quotas per minute.
const RAW_WEIGHT_LIMIT: u32 = 2_400;
const RAW_ORDER_LIMIT: u32 = 1_200;

const WINDOW: Duration = Duration::from_secs(60);

/// Budget share reserved for critical traffic at steady state.
const CRITICAL_RESERVE_PCT: f64 = 20.0;
/// Reserve while liquidation mode is elevated.
const LIQUIDATION_RESERVE_PCT: f64 = 5.0;
/// Effective share of the raw limit under either elevated mode.
const ELEVATED_LIMIT_PCT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    Critical,
}

/// Outbound endpoints with their static weight table. Depth and kline
/// weights depend on the requested limit; all-symbol query forms are an
/// order of magnitude heavier than per-symbol ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Depth { limit: u32 },
    Klines { limit: u32 },
    PlaceOrder,
    BatchOrders { count: u32 },
    CancelOrder,
    CancelAllOpen,
    OpenOrders { all_symbols: bool },
    Account,
    PositionRisk,
    ExchangeInfo,
    Leverage,
    MarginType,
    PositionMode,
    ListenKey,
}

impl Endpoint {
    pub fn weight(&self) -> u32 {
        match self {
            Endpoint::Depth { limit } => match limit {
                0..=50 => 2,
                51..=100 => 5,
                101..=500 => 10,
                _ => 20,
            },
            Endpoint::Klines { limit } => match limit {
                0..=99 => 1,
                100..=499 => 2,
                500..=1000 => 5,
                _ => 10,
            },
            Endpoint::PlaceOrder => 1,
            Endpoint::BatchOrders { count } => 5u32.max(*count),
            Endpoint::CancelOrder => 1,
            Endpoint::CancelAllOpen => 1,
            Endpoint::OpenOrders { all_symbols } => {
                if *all_symbols {
                    40
                } else {
                    1
                }
            }
            Endpoint::Account => 5,
            Endpoint::PositionRisk => 5,
            Endpoint::ExchangeInfo => 1,
            Endpoint::Leverage => 1,
            Endpoint::MarginType => 1,
            Endpoint::PositionMode => 1,
            Endpoint::ListenKey => 1,
        }
    }

    /// How many order slots this call consumes from the order-count quota.
    pub fn order_count(&self) -> u32 {
        match self {
            Endpoint::PlaceOrder => 1,
            Endpoint::BatchOrders { count } => *count,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Widen the effective limit to ~95% of raw for a short burst.
    Burst,
    /// Cascade handling: ~95% of raw and the critical reserve shrinks.
    Liquidation,
}

#[derive(Debug, Clone, Copy)]
pub struct GovernorSnapshot {
    pub weight_used: u32,
    pub weight_limit: u32,
    pub orders_used: u32,
    pub orders_limit: u32,
    pub consecutive_429: u32,
    pub banned: bool,
    pub elevated: Option<Elevation>,
}

struct SlidingWindow {
    entries: VecDeque<(Instant, u32)>,
    sum: u32,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            sum: 0,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, v)) = self.entries.front() {
            if now.duration_since(at) >= WINDOW {
                self.sum -= v;
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn used(&mut self, now: Instant) -> u32 {
        self.evict(now);
        self.sum
    }

    fn push(&mut self, now: Instant, v: u32) {
        if v == 0 {
            return;
        }
        self.entries.push_back((now, v));
        self.sum += v;
    }

    /// Headers are authoritative: collapse local accounting to the reported
    /// figure. The whole amount ages out one window later, which slightly
    /// over-reserves but never under-reserves.
    fn reconcile(&mut self, now: Instant, reported: u32) {
        self.entries.clear();
        self.sum = 0;
        self.push(now, reported);
    }

    /// Time until the oldest entry ages out of the window.
    fn next_expiry(&self, now: Instant) -> Duration {
        match self.entries.front() {
            Some(&(at, _)) => WINDOW.saturating_sub(now.duration_since(at)),
            None => WINDOW,
        }
    }
}

struct GovernorState {
    weight: SlidingWindow,
    orders: SlidingWindow,
    consecutive_429: u32,
    suspended_until: Option<Instant>,
    banned_until: Option<Instant>,
    elevation: Option<(Elevation, Instant)>,
}

/// One caller parked in the opt-in queue.
struct Waiter {
    ticket: u64,
    priority: Priority,
    notify: Arc<Notify>,
}

/// Priority-ordered FIFO of `admit()` callers: higher priority ahead of
/// lower, arrival order within a priority.
struct WaitQueue {
    next_ticket: u64,
    entries: VecDeque<Waiter>,
}

pub struct RateGovernor {
    state: Mutex<GovernorState>,
    waiters: Mutex<WaitQueue>,
    buffer_pct: f64,
}

impl RateGovernor {
    pub fn new(buffer_pct: f64) -> Self {
        Self {
            state: Mutex::new(GovernorState {
                weight: SlidingWindow::new(),
                orders: SlidingWindow::new(),
                consecutive_429: 0,
                suspended_until: None,
                banned_until: None,
                elevation: None,
            }),
            waiters: Mutex::new(WaitQueue {
                next_ticket: 0,
                entries: VecDeque::new(),
            }),
            buffer_pct: buffer_pct.clamp(0.0, 50.0),
        }
    }

    /// Try to admit a call. `Err(wait)` carries the suggested delay before
    /// the next attempt; callers decide whether to queue or give up.
    pub fn try_admit(&self, endpoint: Endpoint, priority: Priority) -> Result<(), Duration> {
        self.try_admit_at(endpoint, priority, Instant::now())
    }

    fn try_admit_at(
        &self,
        endpoint: Endpoint,
        priority: Priority,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut s = self.state.lock();

        if let Some(until) = s.banned_until {
            if now < until {
                return Err(until.duration_since(now));
            }
            s.banned_until = None;
            info!("IP ban expired, resuming admissions");
        }
        if let Some(until) = s.suspended_until {
            if now < until {
                return Err(until.duration_since(now));
            }
            s.suspended_until = None;
        }

        if let Some((_, expires)) = s.elevation {
            if now >= expires {
                s.elevation = None;
            }
        }

        let elevated = s.elevation.map(|(m, _)| m);
        let (weight_limit, order_limit) = self.effective_limits(elevated);
        let reserve_pct = match elevated {
            Some(Elevation::Liquidation) => LIQUIDATION_RESERVE_PCT,
            _ => CRITICAL_RESERVE_PCT,
        };
        let (weight_cap, order_cap) = if priority == Priority::Critical {
            (weight_limit, order_limit)
        } else {
            (
                (weight_limit as f64 * (1.0 - reserve_pct / 100.0)) as u32,
                (order_limit as f64 * (1.0 - reserve_pct / 100.0)) as u32,
            )
        };

        let w = endpoint.weight();
        let o = endpoint.order_count();
        let weight_used = s.weight.used(now);
        let orders_used = s.orders.used(now);

        if weight_used + w > weight_cap {
            return Err(s.weight.next_expiry(now));
        }
        if o > 0 && orders_used + o > order_cap {
            return Err(s.orders.next_expiry(now));
        }

        s.weight.push(now, w);
        s.orders.push(now, o);
        Ok(())
    }

    fn effective_limits(&self, elevated: Option<Elevation>) -> (u32, u32) {
        let pct = match elevated {
            Some(_) => ELEVATED_LIMIT_PCT,
            None => 100.0 - self.buffer_pct,
        };
        (
            (RAW_WEIGHT_LIMIT as f64 * pct / 100.0) as u32,
            (RAW_ORDER_LIMIT as f64 * pct / 100.0) as u32,
        )
    }

    /// Queueing form: parks the caller in a priority-ordered FIFO and waits
    /// until it reaches the head and the windows admit it. Waiters of the
    /// same priority are served strictly in arrival order. Used by callers
    /// that opted into queueing instead of handling the typed rate-limited
    /// error themselves.
    pub async fn admit(&self, endpoint: Endpoint, priority: Priority) {
        // Fast path: nobody queued ahead and the windows have room.
        let queue_empty = self.waiters.lock().entries.is_empty();
        if queue_empty && self.try_admit(endpoint, priority).is_ok() {
            return;
        }

        let (ticket, notify) = self.enqueue(priority);
        let _guard = DequeueGuard {
            governor: self,
            ticket,
        };
        loop {
            if self.is_head(ticket) {
                match self.try_admit(endpoint, priority) {
                    // The guard dequeues us and wakes the next head.
                    Ok(()) => return,
                    Err(wait) => {
                        let wait =
                            wait.clamp(Duration::from_millis(25), Duration::from_millis(250));
                        let _ = tokio::time::timeout(wait, notify.notified()).await;
                    }
                }
            } else {
                // Woken when we become head; the timeout is a lost-wakeup
                // backstop, not the ordering mechanism.
                let _ =
                    tokio::time::timeout(Duration::from_millis(250), notify.notified()).await;
            }
        }
    }

    fn enqueue(&self, priority: Priority) -> (u64, Arc<Notify>) {
        let mut q = self.waiters.lock();
        q.next_ticket += 1;
        let ticket = q.next_ticket;
        let notify = Arc::new(Notify::new());
        // Behind every waiter of equal or higher priority; ahead of lower.
        let pos = q
            .entries
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(q.entries.len());
        q.entries.insert(
            pos,
            Waiter {
                ticket,
                priority,
                notify: notify.clone(),
            },
        );
        (ticket, notify)
    }

    fn dequeue(&self, ticket: u64) {
        let mut q = self.waiters.lock();
        if let Some(pos) = q.entries.iter().position(|w| w.ticket == ticket) {
            q.entries.remove(pos);
        }
        if let Some(head) = q.entries.front() {
            head.notify.notify_one();
        }
    }

    fn is_head(&self, ticket: u64) -> bool {
        self.waiters
            .lock()
            .entries
            .front()
            .map(|w| w.ticket == ticket)
            .unwrap_or(false)
    }

    /// Reconcile local windows against venue quota headers. Headers are
    /// authoritative when present.
    pub fn record_headers(&self, used_weight: Option<u32>, order_count: Option<u32>) {
        let now = Instant::now();
        let mut s = self.state.lock();
        if let Some(w) = used_weight {
            s.weight.reconcile(now, w);
        }
        if let Some(o) = order_count {
            s.orders.reconcile(now, o);
        }
    }

    /// A successful (non-429) response resets the consecutive-429 counter.
    pub fn record_success(&self) {
        self.state.lock().consecutive_429 = 0;
    }

    /// HTTP 429: back off `min(60s, 2^n)` and suspend admissions for that
    /// long. Returns the suggested delay.
    pub fn record_429(&self) -> Duration {
        let now = Instant::now();
        let mut s = self.state.lock();
        s.consecutive_429 += 1;
        let secs = 2u64
            .saturating_pow(s.consecutive_429.min(6))
            .min(60);
        let backoff = Duration::from_secs(secs);
        s.suspended_until = Some(now + backoff);
        warn!(
            consecutive = s.consecutive_429,
            backoff_secs = secs,
            "venue returned 429, suspending admissions"
        );
        backoff
    }

    /// HTTP 418: IP ban. All admissions halt until the published unban time.
    pub fn record_418(&self, retry_after: Option<Duration>) {
        let now = Instant::now();
        let until = now + retry_after.unwrap_or(Duration::from_secs(120));
        let mut s = self.state.lock();
        s.banned_until = Some(until);
        warn!(
            ban_secs = until.duration_since(now).as_secs(),
            "venue returned 418 (IP ban), halting all admissions"
        );
    }

    /// Widen the effective limit for `duration`. Idempotent: re-elevating
    /// extends the expiry.
    pub fn elevate(&self, mode: Elevation, duration: Duration) {
        let mut s = self.state.lock();
        let expires = Instant::now() + duration;
        match s.elevation {
            Some((current, old_expiry)) if current == mode && old_expiry >= expires => {}
            _ => {
                s.elevation = Some((mode, expires));
                info!(?mode, secs = duration.as_secs(), "rate limit elevated");
            }
        }
    }

    pub fn is_banned(&self) -> bool {
        let s = self.state.lock();
        matches!(s.banned_until, Some(until) if Instant::now() < until)
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let now = Instant::now();
        let mut s = self.state.lock();
        let elevated = match s.elevation {
            Some((m, expires)) if now < expires => Some(m),
            _ => None,
        };
        let (weight_limit, orders_limit) = self.effective_limits(elevated);
        GovernorSnapshot {
            weight_used: s.weight.used(now),
            weight_limit,
            orders_used: s.orders.used(now),
            orders_limit,
            consecutive_429: s.consecutive_429,
            banned: matches!(s.banned_until, Some(until) if now < until),
            elevated,
        }
    }
}

/// Removes an `admit()` caller from the queue when its future completes or
/// is dropped mid-wait, then wakes the next head so a cancelled waiter can
/// never wedge the queue.
struct DequeueGuard<'a> {
    governor: &'a RateGovernor,
    ticket: u64,
}

impl Drop for DequeueGuard<'_> {
    fn drop(&mut self) {
        self.governor.dequeue(self.ticket);
    }
}
