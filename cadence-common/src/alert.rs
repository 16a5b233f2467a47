//! User-configurable alert rules

use serde::{Deserialize, Serialize};

use crate::ids::{RuleId, UserId};

/// The real-time statistic an alert rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    OpenRate,
    ClickRate,
    BounceRate,
    ComplaintRate,
    DeliveryRate,
    /// Failed sends in absolute terms
    FailedSends,
    /// Recipients still queued
    QueueBacklog,
    /// Sends per minute over the last hour
    SendingRate,
}

impl std::fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenRate => "open rate",
            Self::ClickRate => "click rate",
            Self::BounceRate => "bounce rate",
            Self::ComplaintRate => "complaint rate",
            Self::DeliveryRate => "delivery rate",
            Self::FailedSends => "failed sends",
            Self::QueueBacklog => "queue backlog",
            Self::SendingRate => "sending rate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
}

impl Comparison {
    /// `value <op> threshold`
    #[must_use]
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub user_id: UserId,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub comparison: Comparison,
    pub severity: AlertSeverity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl AlertRule {
    #[must_use]
    pub fn new(
        user_id: UserId,
        metric: AlertMetric,
        comparison: Comparison,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            id: RuleId::generate(),
            user_id,
            metric,
            threshold,
            comparison,
            severity,
            enabled: true,
        }
    }
}
