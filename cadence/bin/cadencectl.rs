//! Command-line utility for managing a running cadence scheduler
//!
//! This tool provides operational control over the scheduler, including:
//! - Schedule management (submit campaigns, list entries, pause, resume,
//!   cancel, emergency stop)
//! - A/B test management (create, start, analyze, declare and roll out winners)
//! - Real-time statistics, alert rules and status badges
//! - Plan usage checks
//! - System status and health checks

#![allow(clippy::single_match_else)]

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use cadence_common::{
    AlertMetric, AlertRule, AlertSeverity, Campaign, CampaignId, Comparison, ContentRef,
    EntryKind, EntryStatus, PlanTier, RuleId, ScheduleEntry, ScheduleSettings, SendSettings,
    TestConfiguration, TestId, UserConfig, UserId, Variant, VariantId,
};
use cadence_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, ExperimentCommand, MonitorCommand, RequestCommand,
    ResponseData, ResponsePayload, ScheduleCommand, SystemCommand, UsageCommand,
    protocol::format_timestamp,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

/// Command-line utility for managing the cadence scheduler
#[derive(Parser, Debug)]
#[command(name = "cadencectl")]
#[command(about = "Manage the cadence campaign scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    /// Bearer token, when the scheduler requires one
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Campaign schedules and delivery
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// A/B tests
    Experiment {
        #[command(subcommand)]
        action: ExperimentAction,
    },
    /// Real-time statistics and alerts
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
    /// Plan usage
    Usage {
        #[command(subcommand)]
        action: UsageAction,
    },
    /// System status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// List schedule entries
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,

        /// Only entries of this campaign
        #[arg(long)]
        campaign: Option<CampaignId>,
    },
    /// Schedule a campaign described in a RON file
    Submit {
        /// Campaign definition
        file: PathBuf,
    },
    /// Materialise upcoming occurrences of recurring campaigns
    Sync,
    /// Add a one-off entry to a campaign
    Create {
        campaign: CampaignId,

        /// RFC 3339 send time, immediately when omitted
        #[arg(long)]
        at: Option<String>,
    },
    /// Pause a campaign, holding back its pending entries
    Pause { campaign: CampaignId },
    /// Resume a paused campaign
    Resume { campaign: CampaignId },
    /// Cancel a campaign
    Cancel { campaign: CampaignId },
    /// Stop a campaign immediately. This cannot be undone.
    Stop {
        campaign: CampaignId,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Run a delivery pass now
    ProcessNow,
}

#[derive(Subcommand, Debug)]
enum ExperimentAction {
    /// Create a draft test described in a RON file
    Create {
        /// Test definition
        file: PathBuf,
    },
    /// List tests
    List {
        /// Only tests of this campaign
        #[arg(long)]
        campaign: Option<CampaignId>,
    },
    /// View a test and its variants
    View { test: TestId },
    /// Start a draft test
    Start { test: TestId },
    /// Pause an active test
    Pause { test: TestId },
    /// Resume a paused test
    Resume { test: TestId },
    /// Compute results and check for significance
    Analyze { test: TestId },
    /// Declare a winning variant
    DeclareWinner { test: TestId, variant: VariantId },
    /// Send the winning content to the rest of the audience
    Rollout {
        test: TestId,

        /// Share of the remaining audience that receives the winner
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(u8).range(0..=100))]
        percentage: u8,
    },
}

#[derive(Subcommand, Debug)]
enum MonitorAction {
    /// Show real-time statistics for a campaign
    Stats {
        campaign: CampaignId,

        /// Watch mode - continuously update statistics
        #[arg(long)]
        watch: bool,

        /// Update interval in seconds (for watch mode)
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Evaluate a user's alert rules now
    Alerts { user: UserId },
    /// Alerts fired recently for a user
    Recent { user: UserId },
    /// Health badge for a campaign
    Badge { campaign: CampaignId },
    /// List a user's alert rules
    Rules { user: UserId },
    /// Add an alert rule
    AddRule {
        user: UserId,

        #[arg(long, value_enum)]
        metric: MetricArg,

        #[arg(long, value_enum)]
        comparison: ComparisonArg,

        #[arg(long)]
        threshold: f64,

        #[arg(long, value_enum, default_value = "warning")]
        severity: SeverityArg,

        /// Store the rule without evaluating it
        #[arg(long)]
        disabled: bool,
    },
    /// Delete an alert rule
    DeleteRule { rule: RuleId },
}

#[derive(Subcommand, Debug)]
enum UsageAction {
    /// Check whether a user may send more emails now
    Check {
        user: UserId,

        #[arg(long, default_value = "1")]
        count: u64,
    },
    /// Set a user's plan and timezone
    SetPlan {
        user: UserId,

        #[arg(value_enum)]
        plan: PlanArg,

        /// IANA timezone for usage windows, UTC when omitted
        #[arg(long)]
        timezone: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check if the scheduler is responding
    Ping,
    /// Get system status and statistics
    Status,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StatusFilter {
    Pending,
    Processed,
    Skipped,
    Failed,
}

impl From<StatusFilter> for EntryStatus {
    fn from(value: StatusFilter) -> Self {
        match value {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Processed => Self::Processed,
            StatusFilter::Skipped => Self::Skipped,
            StatusFilter::Failed => Self::Failed,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MetricArg {
    OpenRate,
    ClickRate,
    BounceRate,
    ComplaintRate,
    DeliveryRate,
    FailedSends,
    QueueBacklog,
    SendingRate,
}

impl From<MetricArg> for AlertMetric {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::OpenRate => Self::OpenRate,
            MetricArg::ClickRate => Self::ClickRate,
            MetricArg::BounceRate => Self::BounceRate,
            MetricArg::ComplaintRate => Self::ComplaintRate,
            MetricArg::DeliveryRate => Self::DeliveryRate,
            MetricArg::FailedSends => Self::FailedSends,
            MetricArg::QueueBacklog => Self::QueueBacklog,
            MetricArg::SendingRate => Self::SendingRate,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ComparisonArg {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl From<ComparisonArg> for Comparison {
    fn from(value: ComparisonArg) -> Self {
        match value {
            ComparisonArg::Gt => Self::GreaterThan,
            ComparisonArg::Ge => Self::GreaterOrEqual,
            ComparisonArg::Lt => Self::LessThan,
            ComparisonArg::Le => Self::LessOrEqual,
            ComparisonArg::Eq => Self::Equal,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SeverityArg {
    Warning,
    Critical,
}

impl From<SeverityArg> for AlertSeverity {
    fn from(value: SeverityArg) -> Self {
        match value {
            SeverityArg::Warning => Self::Warning,
            SeverityArg::Critical => Self::Critical,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PlanArg {
    Free,
    Pro,
    Enterprise,
}

impl From<PlanArg> for PlanTier {
    fn from(value: PlanArg) -> Self {
        match value {
            PlanArg::Free => Self::Free,
            PlanArg::Pro => Self::Pro,
            PlanArg::Enterprise => Self::Enterprise,
        }
    }
}

/// Campaign definition accepted by `schedule submit`
#[derive(Debug, Deserialize)]
struct CampaignFile {
    /// Reuse an id to reschedule an existing campaign
    #[serde(default)]
    id: Option<CampaignId>,
    user_id: UserId,
    name: String,
    tags: Vec<String>,
    content: ContentRef,
    schedule: ScheduleSettings,
    #[serde(default)]
    send: SendSettings,
}

/// Test definition accepted by `experiment create`
#[derive(Debug, Deserialize)]
struct TestFile {
    campaign_id: CampaignId,
    name: String,
    variants: Vec<VariantFile>,
    #[serde(default)]
    configuration: TestConfiguration,
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    name: String,
    #[serde(default)]
    is_control: bool,
    content: ContentRef,
    #[serde(default)]
    weight: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = check_control_socket(&cli.control_socket, cli.token.as_deref())?;

    match cli.command {
        Commands::Schedule { action } => handle_schedule_command(&client, action).await,
        Commands::Experiment { action } => handle_experiment_command(&client, action).await,
        Commands::Monitor { action } => handle_monitor_command(client, action).await,
        Commands::Usage { action } => handle_usage_command(&client, action).await,
        Commands::System { action } => handle_system_command(&client, action).await,
    }
}

/// Check control socket connectivity and return client
fn check_control_socket(socket_path: &str, token: Option<&str>) -> anyhow::Result<ControlClient> {
    let client = ControlClient::new(socket_path);

    // Check if socket exists first for better error messages
    if let Err(e) = client.check_socket_exists() {
        anyhow::bail!(
            "Cannot connect to the cadence control socket at {socket_path}.\n\
             Error: {e}\n\
             \n\
             Is the scheduler running?\n\
             You can configure the socket path with --control-socket or in cadence.config.ron"
        );
    }

    Ok(match token {
        Some(token) => client.with_token(token),
        None => client,
    })
}

/// Send a command and unwrap the data it returned, if any
async fn send(
    client: &ControlClient,
    command: RequestCommand,
) -> anyhow::Result<Option<ResponseData>> {
    let response = client.send(command).await?;

    match response.payload {
        ResponsePayload::Ok => Ok(None),
        ResponsePayload::Data(data) => Ok(Some(*data)),
        ResponsePayload::Error(err) => anyhow::bail!("Server error: {err}"),
    }
}

/// Ask before doing something that cannot be undone
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Parse a RON definition file
fn read_ron<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    ron::from_str(&content).map_err(|e| anyhow::anyhow!("Invalid {}: {e}", path.display()))
}

fn parse_time(at: &str) -> anyhow::Result<u64> {
    let datetime = chrono::DateTime::parse_from_rfc3339(at)
        .map_err(|e| anyhow::anyhow!("Invalid time {at}: {e}"))?;
    u64::try_from(datetime.timestamp_millis())
        .map_err(|_| anyhow::anyhow!("Time {at} is before the epoch"))
}

/// Handle schedule commands
async fn handle_schedule_command(
    client: &ControlClient,
    action: ScheduleAction,
) -> anyhow::Result<()> {
    let command = match action {
        ScheduleAction::List { status, campaign } => ScheduleCommand::List {
            status: status.map(EntryStatus::from),
            campaign_id: campaign,
        },
        ScheduleAction::Submit { file } => {
            let definition: CampaignFile = read_ron(&file)?;
            let mut campaign = Campaign::new(definition.user_id, definition.name, definition.tags);
            if let Some(id) = definition.id {
                campaign.id = id;
            }
            campaign.content = definition.content;
            campaign.schedule = definition.schedule;
            campaign.send = definition.send;
            println!("Submitting campaign {}", campaign.id);
            ScheduleCommand::Submit {
                campaign: Box::new(campaign),
            }
        }
        ScheduleAction::Sync => ScheduleCommand::Sync,
        ScheduleAction::Create { campaign, at } => ScheduleCommand::Create {
            campaign_id: campaign,
            scheduled_at: at.as_deref().map(parse_time).transpose()?,
        },
        ScheduleAction::Pause { campaign } => ScheduleCommand::Pause {
            campaign_id: campaign,
        },
        ScheduleAction::Resume { campaign } => ScheduleCommand::Resume {
            campaign_id: campaign,
        },
        ScheduleAction::Cancel { campaign } => ScheduleCommand::Cancel {
            campaign_id: campaign,
        },
        ScheduleAction::Stop { campaign, yes } => {
            if !yes
                && !confirm(&format!(
                    "Emergency stop campaign {campaign}? It can never send again."
                ))?
            {
                println!("Cancelled.");
                return Ok(());
            }
            ScheduleCommand::EmergencyStop {
                campaign_id: campaign,
                confirmed: true,
            }
        }
        ScheduleAction::ProcessNow => ScheduleCommand::ProcessNow,
    };

    print_data(send(client, RequestCommand::Schedule(command)).await?);
    Ok(())
}

/// Handle A/B test commands
async fn handle_experiment_command(
    client: &ControlClient,
    action: ExperimentAction,
) -> anyhow::Result<()> {
    let command = match action {
        ExperimentAction::Create { file } => {
            let definition: TestFile = read_ron(&file)?;
            let variants = definition
                .variants
                .into_iter()
                .map(|variant| {
                    let built = Variant::new(variant.name, variant.is_control, variant.content);
                    match variant.weight {
                        Some(weight) => built.with_weight(weight),
                        None => built,
                    }
                })
                .collect();
            ExperimentCommand::Create {
                campaign_id: definition.campaign_id,
                name: definition.name,
                variants,
                configuration: definition.configuration,
            }
        }
        ExperimentAction::List { campaign } => ExperimentCommand::List {
            campaign_id: campaign,
        },
        ExperimentAction::View { test } => ExperimentCommand::View { test_id: test },
        ExperimentAction::Start { test } => ExperimentCommand::Start { test_id: test },
        ExperimentAction::Pause { test } => ExperimentCommand::Pause { test_id: test },
        ExperimentAction::Resume { test } => ExperimentCommand::Resume { test_id: test },
        ExperimentAction::Analyze { test } => ExperimentCommand::Analyze { test_id: test },
        ExperimentAction::DeclareWinner { test, variant } => ExperimentCommand::DeclareWinner {
            test_id: test,
            variant_id: variant,
        },
        ExperimentAction::Rollout { test, percentage } => ExperimentCommand::Rollout {
            test_id: test,
            percentage,
        },
    };

    print_data(send(client, RequestCommand::Experiment(command)).await?);
    Ok(())
}

/// Handle monitoring commands
async fn handle_monitor_command(
    client: ControlClient,
    action: MonitorAction,
) -> anyhow::Result<()> {
    let command = match action {
        MonitorAction::Stats {
            campaign,
            watch: true,
            interval,
        } => {
            // One connection for the whole session
            let client = client.with_persistent_connection();
            loop {
                let data = send(
                    &client,
                    RequestCommand::Monitor(MonitorCommand::Stats {
                        campaign_id: campaign,
                    }),
                )
                .await?;

                // Clear screen
                print!("\x1B[2J\x1B[1;1H");
                print_data(data);
                println!("\nPress Ctrl+C to exit");

                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
        MonitorAction::Stats { campaign, .. } => MonitorCommand::Stats {
            campaign_id: campaign,
        },
        MonitorAction::Alerts { user } => MonitorCommand::Alerts { user_id: user },
        MonitorAction::Recent { user } => MonitorCommand::RecentAlerts { user_id: user },
        MonitorAction::Badge { campaign } => MonitorCommand::Badge {
            campaign_id: campaign,
        },
        MonitorAction::Rules { user } => MonitorCommand::Rules { user_id: user },
        MonitorAction::AddRule {
            user,
            metric,
            comparison,
            threshold,
            severity,
            disabled,
        } => {
            let mut rule = AlertRule::new(
                user,
                metric.into(),
                comparison.into(),
                threshold,
                severity.into(),
            );
            rule.enabled = !disabled;
            MonitorCommand::PutRule { rule }
        }
        MonitorAction::DeleteRule { rule } => MonitorCommand::DeleteRule { rule_id: rule },
    };

    print_data(send(&client, RequestCommand::Monitor(command)).await?);
    Ok(())
}

/// Handle usage commands
async fn handle_usage_command(client: &ControlClient, action: UsageAction) -> anyhow::Result<()> {
    let command = match action {
        UsageAction::Check { user, count } => UsageCommand::Check {
            user_id: user,
            count,
        },
        UsageAction::SetPlan {
            user,
            plan,
            timezone,
        } => {
            let mut config = UserConfig::new(user, plan.into());
            config.timezone = timezone;
            UsageCommand::SetUser { user: config }
        }
    };

    print_data(send(client, RequestCommand::Usage(command)).await?);
    Ok(())
}

/// Handle system management commands
async fn handle_system_command(client: &ControlClient, action: SystemAction) -> anyhow::Result<()> {
    let command = match action {
        SystemAction::Ping => SystemCommand::Ping,
        SystemAction::Status => SystemCommand::Status,
    };

    match send(client, RequestCommand::System(command)).await? {
        None => println!("✓ Pong! Scheduler is responding"),
        data => print_data(data),
    }
    Ok(())
}

fn print_data(data: Option<ResponseData>) {
    let Some(data) = data else {
        println!("✓ Command completed successfully");
        return;
    };

    match data {
        ResponseData::Entries(entries) => {
            println!(
                "{:<28} {:<24} {:<10} {:<10} {:<24}",
                "ENTRY ID", "CAMPAIGN", "STATUS", "KIND", "SCHEDULED"
            );
            println!("{}", "-".repeat(100));
            for summary in &entries {
                let entry = &summary.entry;
                println!(
                    "{:<28} {:<24} {:<10} {:<10} {:<24}",
                    entry.id,
                    truncate(&summary.campaign_name, 24),
                    entry.status,
                    kind_label(entry.kind),
                    format_timestamp(entry.scheduled_at)
                );
            }
            println!("\nTotal: {} entry(s)", entries.len());
        }
        ResponseData::Entry(entry) => print_entry(&entry),
        ResponseData::Scheduled(entries) | ResponseData::ResumedEntries(entries) => {
            println!("✓ {} entry(s) scheduled", entries.len());
            for entry in &entries {
                print_entry(entry);
            }
        }
        ResponseData::Sync(report) => {
            println!(
                "✓ Synced {} campaign(s), {} new entry(s)",
                report.campaigns, report.created
            );
        }
        ResponseData::Pass(report) => {
            println!("=== Delivery Pass ===\n");
            println!("Due:        {}", report.due);
            println!("Processed:  {}", report.processed);
            println!("Partial:    {}", report.partial);
            println!("Deferred:   {}", report.deferred);
            println!("Skipped:    {}", report.skipped);
            println!("Failed:     {}", report.failed);
            println!("Busy:       {}", report.busy);
            println!("Errors:     {}", report.errors);
            println!("Emails sent: {}", report.sent);
        }
        ResponseData::Stop(report) => {
            println!(
                "✓ Campaign stopped, {} pending entry(s) skipped",
                report.skipped
            );
            if !report.in_flight.is_empty() {
                println!("Still finishing:");
                for id in &report.in_flight {
                    println!("  → {id}");
                }
            }
        }
        ResponseData::Tests(tests) => {
            println!(
                "{:<28} {:<24} {:<10} {:<9} {:<28}",
                "TEST ID", "NAME", "STATUS", "VARIANTS", "WINNER"
            );
            println!("{}", "-".repeat(100));
            for test in &tests {
                println!(
                    "{:<28} {:<24} {:<10} {:<9} {:<28}",
                    test.id,
                    truncate(&test.name, 24),
                    test.status,
                    test.variants.len(),
                    test.winning_variant_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string())
                );
            }
            println!("\nTotal: {} test(s)", tests.len());
        }
        ResponseData::Test(test) => {
            println!("Test ID:   {}", test.id);
            println!("Name:      {}", test.name);
            println!("Campaign:  {}", test.campaign_id);
            println!("Status:    {}", test.status);
            println!("Created:   {}", format_timestamp(test.created_at));
            if let Some(started) = test.started_at {
                println!("Started:   {}", format_timestamp(started));
            }
            if let Some(completed) = test.completed_at {
                println!("Completed: {}", format_timestamp(completed));
            }
            println!();
            println!("Variants:");
            for variant in &test.variants {
                let marker = if test.winning_variant_id == Some(variant.id) {
                    "★"
                } else {
                    " "
                };
                println!(
                    "  {marker} {} {:<20} weight {:<4} {} recipient(s){}",
                    variant.id,
                    variant.name,
                    variant.weight,
                    variant.assigned_recipients.len(),
                    if variant.is_control { " (control)" } else { "" }
                );
            }
        }
        ResponseData::Analysis(analysis) => {
            println!("=== Test {} ({}) ===\n", analysis.test_id, analysis.status);
            println!(
                "{:<20} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}",
                "VARIANT", "SENT", "OPEN", "CLICK", "CONV", "P-VALUE", "LIFT"
            );
            for result in &analysis.results {
                let significant = if result.analysis.statistical_significance {
                    " *"
                } else {
                    ""
                };
                println!(
                    "{:<20} {:>8} {:>7.1}% {:>7.1}% {:>7.1}% {:>10} {:>8}{significant}",
                    truncate(&result.name, 20),
                    result.metrics.sent,
                    result.rates.open_rate * 100.0,
                    result.rates.click_rate * 100.0,
                    result.rates.conversion_rate * 100.0,
                    result
                        .analysis
                        .p_value
                        .map_or_else(|| "-".to_string(), |p| format!("{p:.4}")),
                    result
                        .analysis
                        .lift
                        .map_or_else(|| "-".to_string(), |lift| format!("{lift:+.1}%")),
                );
            }
            if let Some(winner) = analysis.winner {
                let how = if analysis.auto_declared {
                    " (declared by this analysis)"
                } else {
                    ""
                };
                println!("\nWinner: {winner}{how}");
            }
        }
        ResponseData::Stats(snapshot) => {
            let stats = &snapshot.stats;
            println!("=== Campaign {} ===\n", stats.campaign_id);
            println!(
                "Computed:      {}{}",
                format_timestamp(snapshot.computed_at),
                if snapshot.stale { " (stale)" } else { "" }
            );
            println!("Health:        {}", stats.health.status);
            for issue in &stats.health.issues {
                println!("  ! {issue}");
            }
            println!();
            println!("Queued:        {}", stats.queue.queued);
            println!("Sent:          {}", stats.queue.sent);
            println!("Failed:        {}", stats.queue.failed);
            println!("Sending rate:  {:.1}/min", stats.sending_rate.current);
            if let Some(eta) = stats.sending_rate.estimated_completion {
                println!("Completion:    {}", format_timestamp(eta));
            }
            println!();
            println!("Delivery:      {:.1}%", stats.rates.delivery * 100.0);
            println!("Open:          {:.1}%", stats.rates.open * 100.0);
            println!("Click:         {:.1}%", stats.rates.click * 100.0);
            println!("Bounce:        {:.1}%", stats.rates.bounce * 100.0);
            println!("Complaint:     {:.1}%", stats.rates.complaint * 100.0);
            if !stats.engagement.is_empty() {
                println!();
                println!("{:<14} {:>8} {:>8} {:>8}", "EVENT", "TOTAL", "5 MIN", "1 HOUR");
                for (kind, window) in &stats.engagement {
                    println!(
                        "{:<14} {:>8} {:>8} {:>8}",
                        format!("{kind:?}").to_lowercase(),
                        window.total,
                        window.last_5_minutes,
                        window.last_hour
                    );
                }
            }
        }
        ResponseData::Alerts(triggers) => {
            if triggers.is_empty() {
                println!("No alerts");
            }
            for trigger in &triggers {
                println!(
                    "[{}] {} campaign {}: {}",
                    severity_label(trigger.severity),
                    format_timestamp(trigger.timestamp),
                    trigger.campaign_id,
                    trigger.message
                );
            }
        }
        ResponseData::Rules(rules) => {
            println!(
                "{:<28} {:<16} {:<4} {:>10} {:<9} {:<8}",
                "RULE ID", "METRIC", "OP", "THRESHOLD", "SEVERITY", "ENABLED"
            );
            println!("{}", "-".repeat(80));
            for rule in &rules {
                println!(
                    "{:<28} {:<16} {:<4} {:>10} {:<9} {:<8}",
                    rule.id,
                    rule.metric.to_string(),
                    rule.comparison.symbol(),
                    rule.threshold,
                    severity_label(rule.severity),
                    if rule.enabled { "yes" } else { "no" }
                );
            }
        }
        ResponseData::Badge(badge) => {
            println!(
                "Health: {}{}",
                badge.status,
                if badge.stale { " (stale)" } else { "" }
            );
            for issue in &badge.issues {
                println!("  ! {issue}");
            }
        }
        ResponseData::Usage(decision) => {
            if decision.allowed {
                println!("✓ Allowed, {} remaining", decision.remaining);
            } else {
                println!(
                    "✗ Denied by the {} limit ({} of {} used)",
                    decision
                        .limiting_window
                        .map_or_else(|| "plan".to_string(), |window| window.to_string()),
                    decision.usage,
                    decision.limit
                );
            }
            println!();
            println!("{:<10} {:>10} {:>10} {:>10}", "WINDOW", "USED", "LIMIT", "REMAINING");
            for window in &decision.windows {
                println!(
                    "{:<10} {:>10} {:>10} {:>10}",
                    window.window.to_string(),
                    window.usage,
                    window.limit,
                    window.remaining()
                );
            }
        }
        ResponseData::SystemStatus(status) => {
            println!("=== Cadence Status ===\n");
            println!("Version:          {}", status.version);
            println!("Uptime:           {}", format_duration(status.uptime_secs));
            println!("Pending entries:  {}", status.pending_entries);
            println!("In flight:        {}", status.in_flight);
            println!("Active tests:     {}", status.active_tests);
        }
        ResponseData::Message(msg) => {
            println!("✓ {msg}");
        }
    }
}

fn print_entry(entry: &ScheduleEntry) {
    println!(
        "  → {} {} at {} ({})",
        entry.id,
        kind_label(entry.kind),
        format_timestamp(entry.scheduled_at),
        entry.status
    );
}

const fn kind_label(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Scheduled => "scheduled",
        EntryKind::Variant(_) => "variant",
        EntryKind::Rollout => "rollout",
    }
}

const fn severity_label(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "CRITICAL",
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut short: String = s.chars().take(width.saturating_sub(1)).collect();
        short.push('…');
        short
    }
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rem_secs = secs % 60;
        format!("{mins}m {rem_secs}s")
    } else if secs < 86400 {
        let hours = secs / 3600;
        let rem_mins = (secs % 3600) / 60;
        format!("{hours}h {rem_mins}m")
    } else {
        let days = secs / 86400;
        let rem_hours = (secs % 86400) / 3600;
        format!("{days}d {rem_hours}h")
    }
}
