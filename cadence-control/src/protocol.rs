//! Control protocol types

use std::fmt::{Display, Formatter};

use cadence_common::{
    AbTest, AlertRule, Campaign, CampaignId, EntryStatus, RuleId, ScheduleEntry,
    TestConfiguration, TestId, Timestamp, UserConfig, UserId, Variant, VariantId,
};
use cadence_delivery::{PassReport, StopReport, UsageDecision};
use cadence_experiment::TestAnalysis;
use cadence_monitor::{AlertTrigger, CampaignBadge, Snapshot};
use cadence_store::{EntrySummary, SyncReport};
use chrono::{TimeZone, Utc, offset::LocalResult};
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Format timestamp (milliseconds since epoch) as human-readable
#[must_use]
pub fn format_timestamp(timestamp_ms: u64) -> String {
    let datetime = Utc.timestamp_millis_opt(i64::try_from(timestamp_ms).unwrap_or(0));
    if let LocalResult::Single(dt) = datetime {
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    } else {
        "unknown".to_string()
    }
}

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// Bearer token, required when the server has authentication enabled
    #[serde(default)]
    pub token: Option<String>,
    /// The actual command to execute
    pub command: RequestCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestCommand {
    Schedule(ScheduleCommand),
    Experiment(ExperimentCommand),
    Monitor(MonitorCommand),
    Usage(UsageCommand),
    System(SystemCommand),
}

/// Schedule entry and campaign delivery commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleCommand {
    /// List schedule entries with their campaign summary
    List {
        status: Option<EntryStatus>,
        campaign_id: Option<CampaignId>,
    },
    /// Validate a campaign, store it and materialise its first entries
    Submit { campaign: Box<Campaign> },
    /// Materialise entries for every active campaign
    Sync,
    /// Add a one-off entry to a campaign
    Create {
        campaign_id: CampaignId,
        /// Defaults to now
        scheduled_at: Option<Timestamp>,
    },
    Pause {
        campaign_id: CampaignId,
    },
    Resume {
        campaign_id: CampaignId,
    },
    Cancel {
        campaign_id: CampaignId,
    },
    /// Irreversibly stop a campaign. Rejected unless `confirmed` is set.
    EmergencyStop {
        campaign_id: CampaignId,
        confirmed: bool,
    },
    /// Run a delivery pass now instead of waiting for the next poll
    ProcessNow,
}

/// A/B test commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExperimentCommand {
    /// Create a draft test over the campaign's current audience
    Create {
        campaign_id: CampaignId,
        name: String,
        variants: Vec<Variant>,
        configuration: TestConfiguration,
    },
    List { campaign_id: Option<CampaignId> },
    View { test_id: TestId },
    Start { test_id: TestId },
    Pause { test_id: TestId },
    Resume { test_id: TestId },
    Analyze { test_id: TestId },
    DeclareWinner { test_id: TestId, variant_id: VariantId },
    Rollout { test_id: TestId, percentage: u8 },
}

/// Real-time monitoring commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorCommand {
    Stats { campaign_id: CampaignId },
    /// Evaluate the user's alert rules now
    Alerts { user_id: UserId },
    /// Alerts fired within the retention window
    RecentAlerts { user_id: UserId },
    Badge { campaign_id: CampaignId },
    Rules { user_id: UserId },
    /// Insert or replace an alert rule
    PutRule { rule: AlertRule },
    DeleteRule { rule_id: RuleId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UsageCommand {
    /// Whether the user may send `count` more emails now
    Check { user_id: UserId, count: u64 },
    /// Insert or replace a user's plan and timezone
    SetUser { user: UserConfig },
}

/// System management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
    /// Get system status and statistics
    Status,
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version
    pub version: u32,
    /// The actual response payload
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed with error message
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    Entries(Vec<EntrySummary>),
    Entry(ScheduleEntry),
    /// Entries materialised for a submitted campaign
    Scheduled(Vec<ScheduleEntry>),
    /// Entries (re)materialised by a resume
    ResumedEntries(Vec<ScheduleEntry>),
    Sync(SyncReport),
    Pass(PassReport),
    Stop(StopReport),
    Tests(Vec<AbTest>),
    Test(AbTest),
    Analysis(TestAnalysis),
    Stats(Snapshot),
    Alerts(Vec<AlertTrigger>),
    Rules(Vec<AlertRule>),
    Badge(CampaignBadge),
    Usage(UsageDecision),
    SystemStatus(SystemStatus),
    /// Simple string message
    Message(String),
}

/// System status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Server version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Pending schedule entries across all campaigns
    pub pending_entries: usize,
    /// Entries being dispatched right now
    pub in_flight: usize,
    pub active_tests: usize,
}

impl Display for SystemStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Version:         {}\n", self.version))?;
        f.write_fmt(format_args!("Uptime:          {}s\n", self.uptime_secs))?;
        f.write_fmt(format_args!("Pending entries: {}\n", self.pending_entries))?;
        f.write_fmt(format_args!("In flight:       {}\n", self.in_flight))?;
        f.write_fmt(format_args!("Active tests:    {}", self.active_tests))
    }
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: None,
            command,
        }
    }

    /// Create a new request with authentication token
    #[must_use]
    pub fn with_token(command: RequestCommand, token: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: Some(token.into()),
            command,
        }
    }

    /// Check if the request version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Reject requests the server must never act on
    ///
    /// # Errors
    ///
    /// Returns the reason if the version is incompatible or an emergency
    /// stop was not confirmed
    pub fn validate(&self) -> Result<(), String> {
        if !self.is_version_compatible() {
            return Err(format!(
                "Incompatible protocol version: client={}, server={PROTOCOL_VERSION}",
                self.version
            ));
        }

        if let RequestCommand::Schedule(ScheduleCommand::EmergencyStop {
            campaign_id,
            confirmed: false,
        }) = &self.command
        {
            return Err(format!(
                "Emergency stop of campaign {campaign_id} is irreversible and must be confirmed"
            ));
        }

        Ok(())
    }
}

impl Response {
    /// Create an error response
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    /// Create a success response with no data
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    /// Create a response with data
    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    /// Check if the response indicates success (not an error)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}
