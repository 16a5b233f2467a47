//! Per-user configuration and plan limits

use serde::{Deserialize, Serialize};

use crate::{ids::UserId, time::UsageWindow};

/// Subscription tier, used to look up static send caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// Hourly, daily and monthly send caps for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub hourly: u64,
    pub daily: u64,
    pub monthly: u64,
}

impl PlanLimits {
    #[must_use]
    pub const fn for_window(&self, window: UsageWindow) -> u64 {
        match window {
            UsageWindow::Hourly => self.hourly,
            UsageWindow::Daily => self.daily,
            UsageWindow::Monthly => self.monthly,
        }
    }

    /// Static plan table
    #[must_use]
    pub const fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                hourly: 10,
                daily: 10,
                monthly: 10,
            },
            PlanTier::Pro => Self {
                hourly: 1_000,
                daily: 10_000,
                monthly: 100_000,
            },
            PlanTier::Enterprise => Self {
                hourly: 10_000,
                daily: 100_000,
                monthly: 1_000_000,
            },
        }
    }
}

/// Explicit per-user configuration record.
///
/// Stored alongside the other entities and passed to the components that
/// need it, rather than read from process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: UserId,
    #[serde(default)]
    pub plan: PlanTier,
    /// IANA timezone used for usage windows and weekend avoidance (UTC when unset)
    #[serde(default)]
    pub timezone: Option<String>,
}

impl UserConfig {
    #[must_use]
    pub const fn new(user_id: UserId, plan: PlanTier) -> Self {
        Self {
            user_id,
            plan,
            timezone: None,
        }
    }
}
