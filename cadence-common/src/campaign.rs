//! Campaigns and their schedule settings

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    ids::{CampaignId, TestId, UserId, VariantId},
    time::{Timestamp, parse_timezone},
};

/// Lifecycle of a campaign as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Cancelled,
    /// Emergency stop, irreversible
    Stopped,
}

impl CampaignStatus {
    /// Whether schedule entries for this campaign may be materialised and sent
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Scheduled | Self::Sending)
    }

    /// Whether not-yet-dispatched work must be held back
    #[must_use]
    pub const fn is_halted(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled | Self::Stopped)
    }

    /// Whether the campaign can never send again
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Stopped)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        })
    }
}

/// What gets rendered for each recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentRef {
    Template { template_id: String },
    Custom { subject: String, html: String, text: String },
}

/// Throughput cap declared on a campaign or recurrence rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRate {
    pub emails_per_hour: Option<u64>,
    pub emails_per_day: Option<u64>,
}

impl SendRate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.emails_per_hour == Some(0) || self.emails_per_day == Some(0) {
            return Err(ConfigError::InvalidSendRate(
                "rates must be greater than zero".to_string(),
            ));
        }
        if let (Some(hour), Some(day)) = (self.emails_per_hour, self.emails_per_day)
            && hour > day
        {
            return Err(ConfigError::InvalidSendRate(format!(
                "hourly rate {hour} exceeds daily rate {day}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceKind {
    Daily,
    Weekly { weekday: Weekday },
    /// Day of month, clamped to the month's length
    Monthly { day: u32 },
    Custom { every_hours: u32 },
}

/// Recurring schedule definition.
///
/// Generates future schedule entries but owns no execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub kind: RecurrenceKind,
    /// IANA timezone in which `send_hour`/`send_minute` are interpreted
    pub timezone: String,
    #[serde(default = "default_send_hour")]
    pub send_hour: u32,
    #[serde(default)]
    pub send_minute: u32,
    #[serde(default)]
    pub send_rate: Option<SendRate>,
}

const fn default_send_hour() -> u32 {
    9
}

impl RecurrenceRule {
    #[must_use]
    pub fn daily(timezone: impl Into<String>, send_hour: u32) -> Self {
        Self {
            kind: RecurrenceKind::Daily,
            timezone: timezone.into(),
            send_hour,
            send_minute: 0,
            send_rate: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_timezone(Some(&self.timezone))?;

        if self.send_hour > 23 || self.send_minute > 59 {
            return Err(ConfigError::InvalidRecurrence(format!(
                "send time {:02}:{:02} is not a valid time of day",
                self.send_hour, self.send_minute
            )));
        }

        match self.kind {
            RecurrenceKind::Monthly { day } if !(1..=31).contains(&day) => {
                return Err(ConfigError::InvalidRecurrence(format!(
                    "day of month {day} is out of range"
                )));
            }
            RecurrenceKind::Custom { every_hours: 0 } => {
                return Err(ConfigError::InvalidRecurrence(
                    "custom interval must be at least one hour".to_string(),
                ));
            }
            _ => {}
        }

        self.send_rate.as_ref().map_or(Ok(()), SendRate::validate)
    }
}

/// When a campaign sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleSettings {
    Immediate,
    Once { at: Timestamp },
    Recurring(RecurrenceRule),
}

/// Throttling and pacing settings applied by the delivery processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SendSettings {
    /// Pause between consecutive emails of a batch
    #[serde(default)]
    pub send_delay_ms: u64,
    #[serde(default)]
    pub send_rate: Option<SendRate>,
    /// Minimum gap between two consecutive entries of this campaign
    #[serde(default)]
    pub min_hours_between: Option<u32>,
    /// Hold entries that come due on a Saturday or Sunday in the account timezone
    #[serde(default)]
    pub avoid_weekends: bool,
    /// Prefer recipients whose local hour is a historically strong one
    #[serde(default)]
    pub optimize_send_time: bool,
}

/// Winner content directed at remaining and future sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub content: ContentRef,
    /// Share of recipients (0..=100) that receive the winner content
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    /// Contacts with any of these tags form the target audience
    pub tags: Vec<String>,
    pub content: ContentRef,
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub send: SendSettings,
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(default)]
    pub rollout: Option<Rollout>,
}

impl Campaign {
    #[must_use]
    pub fn new(user_id: UserId, name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: CampaignId::generate(),
            user_id,
            name: name.into(),
            tags,
            content: ContentRef::Template {
                template_id: "default".to_string(),
            },
            schedule: ScheduleSettings::Immediate,
            send: SendSettings::default(),
            status: CampaignStatus::Draft,
            rollout: None,
        }
    }

    /// Effective send rate, the recurrence rule's rate taking precedence
    #[must_use]
    pub fn send_rate(&self) -> Option<SendRate> {
        match &self.schedule {
            ScheduleSettings::Recurring(rule) => rule.send_rate.or(self.send.send_rate),
            _ => self.send.send_rate,
        }
    }
}
