//! Alert rule evaluation and trigger history

use std::{collections::VecDeque, fmt};

use cadence_common::{
    AlertMetric, AlertRule, AlertSeverity, CampaignId, RuleId, Timestamp, UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::stats::RealTimeStats;

/// The observation that made a rule fire, one variant per watched metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    OpenRate { rate: f64 },
    ClickRate { rate: f64 },
    BounceRate { rate: f64 },
    ComplaintRate { rate: f64 },
    DeliveryRate { rate: f64 },
    FailedSends { count: u64 },
    QueueBacklog { queued: u64 },
    SendingRate { per_minute: f64 },
}

impl AlertKind {
    /// Read the rule's metric off the campaign's statistics
    #[must_use]
    pub fn observe(metric: AlertMetric, stats: &RealTimeStats) -> Self {
        match metric {
            AlertMetric::OpenRate => Self::OpenRate {
                rate: stats.rates.open,
            },
            AlertMetric::ClickRate => Self::ClickRate {
                rate: stats.rates.click,
            },
            AlertMetric::BounceRate => Self::BounceRate {
                rate: stats.rates.bounce,
            },
            AlertMetric::ComplaintRate => Self::ComplaintRate {
                rate: stats.rates.complaint,
            },
            AlertMetric::DeliveryRate => Self::DeliveryRate {
                rate: stats.rates.delivery,
            },
            AlertMetric::FailedSends => Self::FailedSends {
                count: stats.queue.failed,
            },
            AlertMetric::QueueBacklog => Self::QueueBacklog {
                queued: stats.queue.queued,
            },
            AlertMetric::SendingRate => Self::SendingRate {
                per_minute: stats.sending_rate.current,
            },
        }
    }

    /// The value compared against the rule's threshold
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "counts stay far below 2^52")]
    pub fn value(&self) -> f64 {
        match *self {
            Self::OpenRate { rate }
            | Self::ClickRate { rate }
            | Self::BounceRate { rate }
            | Self::ComplaintRate { rate }
            | Self::DeliveryRate { rate } => rate,
            Self::FailedSends { count } => count as f64,
            Self::QueueBacklog { queued } => queued as f64,
            Self::SendingRate { per_minute } => per_minute,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRate { rate } => write!(f, "open rate {:.1}%", rate * 100.0),
            Self::ClickRate { rate } => write!(f, "click rate {:.1}%", rate * 100.0),
            Self::BounceRate { rate } => write!(f, "bounce rate {:.1}%", rate * 100.0),
            Self::ComplaintRate { rate } => write!(f, "complaint rate {:.2}%", rate * 100.0),
            Self::DeliveryRate { rate } => write!(f, "delivery rate {:.1}%", rate * 100.0),
            Self::FailedSends { count } => write!(f, "{count} failed sends"),
            Self::QueueBacklog { queued } => write!(f, "{queued} recipients queued"),
            Self::SendingRate { per_minute } => {
                write!(f, "sending {per_minute:.1} emails per minute")
            }
        }
    }
}

/// An ephemeral record of a rule firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub rule_id: RuleId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: Timestamp,
}

/// Evaluate one rule against one campaign's statistics
#[must_use]
pub fn evaluate(rule: &AlertRule, stats: &RealTimeStats, now: Timestamp) -> Option<AlertTrigger> {
    if !rule.enabled {
        return None;
    }

    let kind = AlertKind::observe(rule.metric, stats);
    rule.comparison
        .evaluate(kind.value(), rule.threshold)
        .then(|| AlertTrigger {
            rule_id: rule.id,
            user_id: rule.user_id,
            campaign_id: stats.campaign_id,
            kind,
            severity: rule.severity,
            message: format!(
                "{kind} ({} {})",
                rule.comparison.symbol(),
                threshold_label(rule.metric, rule.threshold)
            ),
            timestamp: now,
        })
}

fn threshold_label(metric: AlertMetric, threshold: f64) -> String {
    match metric {
        AlertMetric::OpenRate
        | AlertMetric::ClickRate
        | AlertMetric::BounceRate
        | AlertMetric::ComplaintRate
        | AlertMetric::DeliveryRate => format!("{:.1}%", threshold * 100.0),
        AlertMetric::FailedSends | AlertMetric::QueueBacklog | AlertMetric::SendingRate => {
            format!("{threshold}")
        }
    }
}

/// Recently fired triggers, bounded in count and age
#[derive(Debug)]
pub struct AlertHistory {
    triggers: Mutex<VecDeque<AlertTrigger>>,
    capacity: usize,
    retention_ms: u64,
}

impl AlertHistory {
    #[must_use]
    pub fn new(capacity: usize, retention_ms: u64) -> Self {
        Self {
            triggers: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            retention_ms,
        }
    }

    pub fn record(&self, trigger: AlertTrigger) {
        let mut triggers = self.triggers.lock();
        if triggers.len() == self.capacity {
            triggers.pop_front();
        }
        triggers.push_back(trigger);
    }

    /// Triggers of `user` still within the retention window, oldest first
    pub fn recent(&self, user: UserId, now: Timestamp) -> Vec<AlertTrigger> {
        let mut triggers = self.triggers.lock();
        let cutoff = now.saturating_sub(self.retention_ms);
        while triggers.front().is_some_and(|trigger| trigger.timestamp < cutoff) {
            triggers.pop_front();
        }

        triggers
            .iter()
            .filter(|trigger| trigger.user_id == user)
            .cloned()
            .collect()
    }
}
