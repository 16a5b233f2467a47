//! Traffic-light health classification

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{config::HealthThresholds, stats::Rates};

/// Ordered from best to worst
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Good,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// One reason a campaign is not healthy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HealthIssue {
    HighBounceRate { rate: f64, threshold: f64 },
    HighComplaintRate { rate: f64, threshold: f64 },
    LowDeliveryRate { rate: f64, threshold: f64 },
    LowOpenRate { rate: f64, threshold: f64, sent: u64 },
    /// Schedule entries that ended without a single successful send
    FailedEntries { count: u64 },
    /// The campaign was emergency-stopped
    Stopped,
}

impl HealthIssue {
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        match self {
            Self::HighBounceRate { .. } | Self::HighComplaintRate { .. } | Self::Stopped => {
                HealthStatus::Critical
            }
            Self::LowDeliveryRate { .. }
            | Self::LowOpenRate { .. }
            | Self::FailedEntries { .. } => HealthStatus::Warning,
        }
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighBounceRate { rate, threshold } => write!(
                f,
                "Bounce rate {:.1}% is above {:.1}%",
                rate * 100.0,
                threshold * 100.0
            ),
            Self::HighComplaintRate { rate, threshold } => write!(
                f,
                "Complaint rate {:.2}% is above {:.2}%",
                rate * 100.0,
                threshold * 100.0
            ),
            Self::LowDeliveryRate { rate, threshold } => write!(
                f,
                "Delivery rate {:.1}% is below {:.1}%",
                rate * 100.0,
                threshold * 100.0
            ),
            Self::LowOpenRate {
                rate,
                threshold,
                sent,
            } => write!(
                f,
                "Open rate {:.1}% is below {:.1}% after {sent} sends",
                rate * 100.0,
                threshold * 100.0
            ),
            Self::FailedEntries { count: 1 } => f.write_str("1 scheduled send failed"),
            Self::FailedEntries { count } => write!(f, "{count} scheduled sends failed"),
            Self::Stopped => f.write_str("Campaign was emergency-stopped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
}

impl Health {
    #[must_use]
    pub fn from_issues(issues: Vec<HealthIssue>) -> Self {
        Self {
            status: issues
                .iter()
                .map(HealthIssue::status)
                .max()
                .unwrap_or_default(),
            issues,
        }
    }

    /// Human-readable reasons for a non-good status
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }
}

/// Classify a campaign from its rates. Nothing is judged before the first
/// successful send, and the open rate only once `open_rate_min_volume`
/// sends went out.
#[must_use]
pub fn classify(rates: &Rates, sent: u64, thresholds: &HealthThresholds) -> Health {
    if sent == 0 {
        return Health::default();
    }

    let mut issues = Vec::new();

    if rates.bounce > thresholds.critical_bounce_rate {
        issues.push(HealthIssue::HighBounceRate {
            rate: rates.bounce,
            threshold: thresholds.critical_bounce_rate,
        });
    }
    if rates.complaint > thresholds.critical_complaint_rate {
        issues.push(HealthIssue::HighComplaintRate {
            rate: rates.complaint,
            threshold: thresholds.critical_complaint_rate,
        });
    }
    if rates.delivery < thresholds.warning_delivery_rate {
        issues.push(HealthIssue::LowDeliveryRate {
            rate: rates.delivery,
            threshold: thresholds.warning_delivery_rate,
        });
    }
    if sent >= thresholds.open_rate_min_volume && rates.open < thresholds.low_open_rate {
        issues.push(HealthIssue::LowOpenRate {
            rate: rates.open,
            threshold: thresholds.low_open_rate,
            sent,
        });
    }

    Health::from_issues(issues)
}

/// Campaign-level status badge: the worst unresolved issue across the
/// campaign's entries and its current health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignBadge {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    /// Health was taken from an earlier snapshot
    pub stale: bool,
}
