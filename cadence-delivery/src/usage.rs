//! Per-user plan caps over hourly, daily and monthly windows
//!
//! Usage is never stored as a counter: each window's usage is the number of
//! successful sends in the send log whose timestamp falls inside the window,
//! evaluated in the user's timezone.
//!
//! [`UsageLimiter::check`] is a pure read. Concurrent senders instead go
//! through [`UsageLimiter::reserve`], which serialises per user and counts
//! both committed sends and outstanding reservations, so the plan cap holds
//! even while many sends for the same user are in flight.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use cadence_common::{
    CollaboratorError, PlanLimits, PlanLookup, PlanTier, Timestamp, UsageWindow, UserConfig,
    UserId, internal, time::parse_timezone,
};
use cadence_store::EventLog;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CapacityError, DeliveryError};

/// Plan caps keyed by tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTable {
    #[serde(default = "default_free")]
    pub free: PlanLimits,
    #[serde(default = "default_pro")]
    pub pro: PlanLimits,
    #[serde(default = "default_enterprise")]
    pub enterprise: PlanLimits,
}

const fn default_free() -> PlanLimits {
    PlanLimits::for_tier(PlanTier::Free)
}

const fn default_pro() -> PlanLimits {
    PlanLimits::for_tier(PlanTier::Pro)
}

const fn default_enterprise() -> PlanLimits {
    PlanLimits::for_tier(PlanTier::Enterprise)
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            free: default_free(),
            pro: default_pro(),
            enterprise: default_enterprise(),
        }
    }
}

impl PlanTable {
    #[must_use]
    pub const fn limits(&self, tier: PlanTier) -> PlanLimits {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

#[async_trait]
impl PlanLookup for PlanTable {
    async fn plan_limits(&self, user: &UserConfig) -> Result<PlanLimits, CollaboratorError> {
        Ok(self.limits(user.plan))
    }
}

/// Usage of a single window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub window: UsageWindow,
    pub usage: u64,
    pub limit: u64,
}

impl WindowUsage {
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }

    #[allow(clippy::cast_precision_loss)]
    fn remaining_ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.remaining() as f64 / self.limit as f64
        }
    }
}

/// Answer to "may this user send `count` more emails now?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDecision {
    pub allowed: bool,
    /// The most restrictive denying window, set only when denied
    pub limiting_window: Option<UsageWindow>,
    /// Usage of the most restrictive window
    pub usage: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Every window, monthly first
    pub windows: Vec<WindowUsage>,
}

impl UsageDecision {
    fn evaluate(windows: Vec<WindowUsage>, count: u64) -> Self {
        let denied = |w: &WindowUsage| w.usage.saturating_add(count) > w.limit;
        let allowed = !windows.iter().any(denied);

        // Ties keep the first candidate, and windows are ordered longest first
        let tightest = windows
            .iter()
            .filter(|w| allowed || denied(w))
            .fold(None::<&WindowUsage>, |best, w| match best {
                Some(best) if best.remaining_ratio() <= w.remaining_ratio() => Some(best),
                _ => Some(w),
            })
            .copied();

        Self {
            allowed,
            limiting_window: if allowed {
                None
            } else {
                tightest.map(|w| w.window)
            },
            usage: tightest.map_or(0, |w| w.usage),
            limit: tightest.map_or(0, |w| w.limit),
            remaining: tightest.map_or(0, |w| w.remaining()),
            windows,
        }
    }

    /// The largest count that would be allowed right now
    #[must_use]
    pub fn headroom(&self) -> u64 {
        self.windows
            .iter()
            .map(WindowUsage::remaining)
            .min()
            .unwrap_or(0)
    }

    fn capacity_error(&self) -> CapacityError {
        CapacityError::PlanLimit {
            window: self.limiting_window.unwrap_or(UsageWindow::Monthly),
            usage: self.usage,
            limit: self.limit,
            remaining: self.remaining,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    /// Serialises check-then-reserve for one user
    gate: tokio::sync::Mutex<()>,
    /// Sends reserved but not yet committed or released
    reserved: AtomicU64,
}

/// Permission to send `count` emails, held until the outcome is known.
///
/// Dropping a reservation without committing it releases it.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<Ledger>,
    user: UserId,
    count: u64,
}

impl Reservation {
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// The sends happened and are now in the send log
    pub fn commit(self) {
        internal!(user_id = %self.user, "Committed reservation of {}", self.count);
    }

    /// The sends did not happen
    pub fn release(self) {
        internal!(user_id = %self.user, "Released reservation of {}", self.count);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.reserved.fetch_sub(self.count, Ordering::SeqCst);
    }
}

pub struct UsageLimiter {
    log: Arc<dyn EventLog>,
    plans: Arc<dyn PlanLookup>,
    ledgers: DashMap<UserId, Arc<Ledger>>,
}

impl std::fmt::Debug for UsageLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLimiter")
            .field("log", &self.log)
            .field("users", &self.ledgers.len())
            .finish_non_exhaustive()
    }
}

impl UsageLimiter {
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, plans: Arc<dyn PlanLookup>) -> Self {
        Self {
            log,
            plans,
            ledgers: DashMap::new(),
        }
    }

    fn ledger(&self, user: UserId) -> Arc<Ledger> {
        self.ledgers.entry(user).or_default().clone()
    }

    async fn windows(
        &self,
        user: &UserConfig,
        now: Timestamp,
        extra: u64,
    ) -> Result<Vec<WindowUsage>, DeliveryError> {
        let limits = self.plans.plan_limits(user).await?;
        let tz = parse_timezone(user.timezone.as_deref()).unwrap_or(chrono_tz::Tz::UTC);

        let mut windows = Vec::with_capacity(UsageWindow::ALL.len());
        for window in UsageWindow::ALL {
            let (start, end) = window.bounds(now, tz);
            let sent = self.log.count_sent(user.user_id, start, end).await?;
            windows.push(WindowUsage {
                window,
                usage: sent.saturating_add(extra),
                limit: limits.for_window(window),
            });
        }

        Ok(windows)
    }

    /// Decide whether `count` more sends fit every window. No side effects.
    pub async fn check(
        &self,
        user: &UserConfig,
        count: u64,
        now: Timestamp,
    ) -> Result<UsageDecision, DeliveryError> {
        Ok(UsageDecision::evaluate(
            self.windows(user, now, 0).await?,
            count,
        ))
    }

    /// Remaining sends before any window's cap, net of outstanding reservations
    pub async fn headroom(&self, user: &UserConfig, now: Timestamp) -> Result<u64, DeliveryError> {
        let reserved = self.ledger(user.user_id).reserved.load(Ordering::SeqCst);
        Ok(UsageDecision::evaluate(self.windows(user, now, reserved).await?, 0).headroom())
    }

    /// Reserve `count` sends, failing with a capacity error when any window
    /// would exceed its cap once outstanding reservations are included.
    pub async fn reserve(
        &self,
        user: &UserConfig,
        count: u64,
        now: Timestamp,
    ) -> Result<Reservation, DeliveryError> {
        let ledger = self.ledger(user.user_id);
        let _gate = ledger.gate.lock().await;

        let reserved = ledger.reserved.load(Ordering::SeqCst);
        let decision = UsageDecision::evaluate(self.windows(user, now, reserved).await?, count);

        if !decision.allowed {
            internal!(
                level = DEBUG,
                user_id = %user.user_id,
                "Reservation of {count} denied by the {:?} window",
                decision.limiting_window
            );
            return Err(decision.capacity_error().into());
        }

        ledger.reserved.fetch_add(count, Ordering::SeqCst);
        Ok(Reservation {
            ledger: Arc::clone(&ledger),
            user: user.user_id,
            count,
        })
    }
}
