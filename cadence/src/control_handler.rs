//! Control handler implementation for the cadence scheduler
//!
//! This module implements the `CommandHandler` trait to process control
//! requests against the running delivery processor, experiment engine and
//! monitor.

use std::{fmt::Display, sync::Arc, time::Instant};

use async_trait::async_trait;
use cadence_common::{
    EntryStatus, TestStatus,
    time::{now_ms, parse_timezone},
};
use cadence_control::{
    CommandHandler, ControlError, ExperimentCommand, MonitorCommand, Request, RequestCommand,
    Response, ResponseData, ScheduleCommand, SystemCommand, SystemStatus, UsageCommand,
};
use cadence_delivery::DeliveryQueryService;
use cadence_experiment::ExperimentEngine;
use cadence_monitor::Monitor;
use cadence_store::{EntryFilter, ScheduleStore};

type Result<T> = cadence_control::Result<T>;

fn server_error(e: impl Display) -> ControlError {
    ControlError::ServerError(e.to_string())
}

/// Handler for control commands
pub struct CadenceControlHandler {
    delivery: Arc<dyn DeliveryQueryService>,
    experiment: Arc<ExperimentEngine>,
    monitor: Arc<Monitor>,
    /// Server start time for uptime calculation
    start_time: Instant,
}

impl std::fmt::Debug for CadenceControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceControlHandler")
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

impl CadenceControlHandler {
    /// Create a new control handler
    #[must_use]
    pub fn new(
        delivery: Arc<dyn DeliveryQueryService>,
        experiment: Arc<ExperimentEngine>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            delivery,
            experiment,
            monitor,
            start_time: Instant::now(),
        }
    }

    fn schedule(&self) -> Result<&ScheduleStore> {
        self.delivery.schedule().map_err(server_error)
    }
}

#[async_trait]
impl CommandHandler for CadenceControlHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        request.validate().map_err(ControlError::Rejected)?;

        match request.command {
            RequestCommand::Schedule(command) => self.handle_schedule_command(command).await,
            RequestCommand::Experiment(command) => self.handle_experiment_command(command).await,
            RequestCommand::Monitor(command) => self.handle_monitor_command(command).await,
            RequestCommand::Usage(command) => self.handle_usage_command(command).await,
            RequestCommand::System(command) => self.handle_system_command(command).await,
        }
    }
}

impl CadenceControlHandler {
    /// Handle schedule entry and campaign delivery commands
    async fn handle_schedule_command(&self, command: ScheduleCommand) -> Result<Response> {
        let now = now_ms();

        match command {
            ScheduleCommand::List {
                status,
                campaign_id,
            } => {
                let filter = EntryFilter {
                    campaign_id,
                    status,
                    ..EntryFilter::default()
                };
                let mut entries = self
                    .schedule()?
                    .list_entries(&filter)
                    .await
                    .map_err(server_error)?;
                entries.sort_by_key(|summary| summary.entry.scheduled_at);
                Ok(Response::data(ResponseData::Entries(entries)))
            }

            ScheduleCommand::Submit { campaign } => {
                let entries = self
                    .schedule()?
                    .schedule_campaign(*campaign, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Scheduled(entries)))
            }

            ScheduleCommand::Sync => {
                let report = self
                    .schedule()?
                    .sync_campaign_schedules(now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Sync(report)))
            }

            ScheduleCommand::Create {
                campaign_id,
                scheduled_at,
            } => {
                let entry = self
                    .schedule()?
                    .create_entry(campaign_id, scheduled_at, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Entry(entry)))
            }

            ScheduleCommand::Pause { campaign_id } => {
                let skipped = self
                    .delivery
                    .pause_campaign(campaign_id)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Paused campaign {campaign_id}, {skipped} pending entries held back"
                ))))
            }

            ScheduleCommand::Resume { campaign_id } => {
                let entries = self
                    .delivery
                    .resume_campaign(campaign_id, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::ResumedEntries(entries)))
            }

            ScheduleCommand::Cancel { campaign_id } => {
                let skipped = self
                    .delivery
                    .cancel_campaign(campaign_id)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Cancelled campaign {campaign_id}, {skipped} pending entries skipped"
                ))))
            }

            ScheduleCommand::EmergencyStop { campaign_id, .. } => {
                let report = self
                    .delivery
                    .emergency_stop(campaign_id)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Stop(report)))
            }

            ScheduleCommand::ProcessNow => {
                let report = self.delivery.process_now(now).await.map_err(server_error)?;
                Ok(Response::data(ResponseData::Pass(report)))
            }
        }
    }

    /// Handle A/B test commands
    async fn handle_experiment_command(&self, command: ExperimentCommand) -> Result<Response> {
        let now = now_ms();
        let engine = &self.experiment;

        let test = match command {
            ExperimentCommand::Create {
                campaign_id,
                name,
                variants,
                configuration,
            } => engine
                .create(campaign_id, name, variants, configuration, now)
                .await
                .map_err(server_error)?,
            ExperimentCommand::List { campaign_id } => {
                let tests = engine.tests(campaign_id).await.map_err(server_error)?;
                return Ok(Response::data(ResponseData::Tests(tests)));
            }
            ExperimentCommand::View { test_id } => {
                engine.test(test_id).await.map_err(server_error)?
            }
            ExperimentCommand::Start { test_id } => {
                engine.start(test_id, now).await.map_err(server_error)?
            }
            ExperimentCommand::Pause { test_id } => {
                engine.pause(test_id).await.map_err(server_error)?
            }
            ExperimentCommand::Resume { test_id } => {
                engine.resume(test_id, now).await.map_err(server_error)?
            }
            ExperimentCommand::Analyze { test_id } => {
                let analysis = engine.analyze(test_id, now).await.map_err(server_error)?;
                return Ok(Response::data(ResponseData::Analysis(analysis)));
            }
            ExperimentCommand::DeclareWinner {
                test_id,
                variant_id,
            } => engine
                .declare_winner(test_id, variant_id, now)
                .await
                .map_err(server_error)?,
            ExperimentCommand::Rollout {
                test_id,
                percentage,
            } => {
                let entry = engine
                    .rollout_winner(test_id, percentage, now)
                    .await
                    .map_err(server_error)?;
                return Ok(Response::data(ResponseData::Entry(entry)));
            }
        };

        Ok(Response::data(ResponseData::Test(test)))
    }

    /// Handle real-time monitoring commands
    async fn handle_monitor_command(&self, command: MonitorCommand) -> Result<Response> {
        let now = now_ms();

        match command {
            MonitorCommand::Stats { campaign_id } => {
                let snapshot = self
                    .monitor
                    .real_time_stats(campaign_id, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Stats(snapshot)))
            }

            MonitorCommand::Alerts { user_id } => {
                let triggers = self
                    .monitor
                    .alert_triggers(user_id, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Alerts(triggers)))
            }

            MonitorCommand::RecentAlerts { user_id } => {
                let triggers = self
                    .monitor
                    .recent_triggers(user_id, now)
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Alerts(triggers)))
            }

            MonitorCommand::Badge { campaign_id } => {
                let badge = self
                    .monitor
                    .campaign_badge(campaign_id, now)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Badge(badge)))
            }

            MonitorCommand::Rules { user_id } => {
                let rules = self
                    .schedule()?
                    .backing()
                    .alert_rules(user_id)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Rules(rules)))
            }

            MonitorCommand::PutRule { rule } => {
                if !rule.threshold.is_finite() {
                    return Err(ControlError::ServerError(format!(
                        "alert threshold {} is not a number",
                        rule.threshold
                    )));
                }
                self.schedule()?
                    .backing()
                    .put_alert_rule(&rule)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Saved alert rule {}",
                    rule.id
                ))))
            }

            MonitorCommand::DeleteRule { rule_id } => {
                self.schedule()?
                    .backing()
                    .delete_alert_rule(rule_id)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Deleted alert rule {rule_id}"
                ))))
            }
        }
    }

    /// Handle usage limit commands
    async fn handle_usage_command(&self, command: UsageCommand) -> Result<Response> {
        match command {
            UsageCommand::Check { user_id, count } => {
                let decision = self
                    .delivery
                    .check_usage(user_id, count, now_ms())
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Usage(decision)))
            }

            UsageCommand::SetUser { user } => {
                parse_timezone(user.timezone.as_deref()).map_err(server_error)?;
                self.schedule()?
                    .backing()
                    .put_user(&user)
                    .await
                    .map_err(server_error)?;
                Ok(Response::data(ResponseData::Message(format!(
                    "Saved user {}",
                    user.user_id
                ))))
            }
        }
    }

    /// Handle system management commands
    async fn handle_system_command(&self, command: SystemCommand) -> Result<Response> {
        match command {
            SystemCommand::Ping => Ok(Response::ok()),
            SystemCommand::Status => {
                let pending_entries = self
                    .schedule()?
                    .backing()
                    .entries(&EntryFilter::default().with_status(EntryStatus::Pending))
                    .await
                    .map_err(server_error)?
                    .len();
                let active_tests = self
                    .experiment
                    .tests(None)
                    .await
                    .map_err(server_error)?
                    .iter()
                    .filter(|test| test.status == TestStatus::Active)
                    .count();

                let status = SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    pending_entries,
                    in_flight: self.delivery.in_flight().len(),
                    active_tests,
                };

                Ok(Response::data(ResponseData::SystemStatus(status)))
            }
        }
    }
}
