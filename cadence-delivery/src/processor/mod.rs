//! Delivery processor orchestration

mod dispatch;
mod pass;

use std::{sync::Arc, time::Duration};

use cadence_common::{
    CampaignId, CampaignStatus, Contacts, EntryId, PlanLookup, PlanTier, Renderer,
    ScheduleEntry, Signal, Timestamp, Transport, UserConfig, UserId, internal, time::now_ms,
    tracing,
};
use cadence_store::{EventLog, ScheduleStore};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeliveryError, PermanentError, SystemError},
    optimizer::{OptimizerConfig, SendTimeOptimizer},
    queue::DeliveryQueue,
    rate_limiter::{RateLimitConfig, RateLimiter},
    retry::RetryPolicy,
    usage::{PlanTable, UsageDecision, UsageLimiter},
};

const fn default_poll_interval() -> u64 {
    60
}

const fn default_max_concurrent_entries() -> usize {
    4
}

const fn default_max_concurrent_sends() -> usize {
    8
}

const fn default_send_timeout() -> u64 {
    30
}

const fn default_max_batch_size() -> usize {
    500
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Collaborators and storage the processor works against
#[derive(Clone)]
pub struct DeliveryContext {
    pub schedule: ScheduleStore,
    pub log: Arc<dyn EventLog>,
    pub contacts: Arc<dyn Contacts>,
    pub transport: Arc<dyn Transport>,
    pub renderer: Arc<dyn Renderer>,
    /// Plan limits source, the processor's plan table when unset
    pub plans: Option<Arc<dyn PlanLookup>>,
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("schedule", &self.schedule)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

/// Why a due entry was left pending this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Deferral {
    /// The campaign avoids weekends and it is one in the campaign's timezone
    Weekend,
    /// The previous entry was sent less than `min_hours_between` ago
    MinGap { until: Timestamp },
    /// The campaign's hourly or daily send rate is used up
    SendRate,
    /// The user's plan has no headroom left
    PlanLimit,
    /// Every outstanding recipient is backing off after a failure
    RetryBackoff { until: Option<Timestamp> },
}

/// What a pass did with one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOutcome {
    /// Finished with `recipient_count` successful sends, `sent` of them this pass
    Processed { recipient_count: u64, sent: u64 },
    Skipped,
    Failed,
    /// A batch went out and recipients remain
    Partial { sent: u64, outstanding: u64 },
    Deferred(Deferral),
    /// Another pass is working the entry
    Busy,
    /// The entry was already terminal
    NoOp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub due: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub partial: usize,
    pub deferred: usize,
    pub busy: usize,
    /// Entries left pending because of an error
    pub errors: usize,
    /// Successful sends during the pass
    pub sent: u64,
}

impl PassReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Processed { sent, .. } => {
                self.processed += 1;
                self.sent += sent;
            }
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Partial { sent, .. } => {
                self.partial += 1;
                self.sent += sent;
            }
            EntryOutcome::Deferred(_) => self.deferred += 1,
            EntryOutcome::Busy => self.busy += 1,
            EntryOutcome::NoOp => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Pending entries moved to skipped
    pub skipped: usize,
    /// Entries already dispatching, left to complete
    pub in_flight: Vec<EntryId>,
}

/// Settings copied out of the processor config for the workers
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub poll_interval: Duration,
    pub max_concurrent_entries: usize,
    pub max_concurrent_sends: usize,
    pub send_delay_ms: u64,
    pub send_timeout: Duration,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
}

/// Everything a pass needs, shared with the tasks it spawns
#[derive(Debug)]
pub(crate) struct Inner {
    pub ctx: DeliveryContext,
    pub settings: Settings,
    pub queue: DeliveryQueue,
    pub usage: UsageLimiter,
    pub rate_limiter: RateLimiter,
    pub optimizer: SendTimeOptimizer,
}

impl Inner {
    pub(crate) async fn user_config(&self, user: UserId) -> Result<UserConfig, DeliveryError> {
        Ok(self
            .ctx
            .schedule
            .backing()
            .user(user)
            .await?
            .unwrap_or_else(|| UserConfig::new(user, PlanTier::default())))
    }
}

/// Processor for campaign schedule entries
///
/// Each poll materialises recurring occurrences, then works every due entry:
/// its audience is resolved, limited by send rate and plan headroom, and
/// handed to the transport one recipient at a time.
#[derive(Debug, Deserialize)]
pub struct DeliveryProcessor {
    /// How often to poll for due entries (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Entries worked in parallel during one pass
    ///
    /// Default: 4
    #[serde(default = "default_max_concurrent_entries")]
    pub max_concurrent_entries: usize,

    /// Sends in flight at once for a single entry
    ///
    /// Default: 8
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Delay between sends when the campaign does not set one (in milliseconds)
    ///
    /// Default: 0
    #[serde(default)]
    pub send_delay_ms: u64,

    /// How long a transport call may take before it counts as failed (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Most recipients dispatched for one entry in one pass
    ///
    /// Default: 500
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long shutdown waits for an in-flight pass (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub plans: PlanTable,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Entry claims and halted campaigns
    #[serde(skip)]
    queue: DeliveryQueue,

    /// Initialised in `init()`
    #[serde(skip)]
    inner: Option<Arc<Inner>>,
}

impl Default for DeliveryProcessor {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrent_entries: default_max_concurrent_entries(),
            max_concurrent_sends: default_max_concurrent_sends(),
            send_delay_ms: 0,
            send_timeout_secs: default_send_timeout(),
            max_batch_size: default_max_batch_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            plans: PlanTable::default(),
            optimizer: OptimizerConfig::default(),
            queue: DeliveryQueue::new(),
            inner: None,
        }
    }
}

impl DeliveryProcessor {
    /// Initialise the delivery processor
    ///
    /// # Errors
    ///
    /// Returns an error if the processor cannot be initialised
    pub fn init(&mut self, ctx: DeliveryContext) -> Result<(), DeliveryError> {
        internal!("Initialising Delivery Processor ...");

        if self.poll_interval_secs == 0 {
            return Err(
                SystemError::Internal("poll_interval_secs must be positive".to_string()).into(),
            );
        }

        let plans: Arc<dyn PlanLookup> = ctx
            .plans
            .clone()
            .unwrap_or_else(|| Arc::new(self.plans.clone()));

        let inner = Inner {
            usage: UsageLimiter::new(Arc::clone(&ctx.log), plans),
            rate_limiter: RateLimiter::new(self.rate_limit.clone()),
            optimizer: SendTimeOptimizer::new(self.optimizer.clone()),
            settings: Settings {
                poll_interval: Duration::from_secs(self.poll_interval_secs),
                max_concurrent_entries: self.max_concurrent_entries.max(1),
                max_concurrent_sends: self.max_concurrent_sends.max(1),
                send_delay_ms: self.send_delay_ms,
                send_timeout: Duration::from_secs(self.send_timeout_secs),
                max_batch_size: self.max_batch_size.max(1),
                retry: self.retry.clone(),
            },
            queue: self.queue.clone(),
            ctx,
        };

        internal!(
            poll_interval_secs = self.poll_interval_secs,
            max_concurrent_entries = inner.settings.max_concurrent_entries,
            max_concurrent_sends = inner.settings.max_concurrent_sends,
            provider = %inner.rate_limiter.provider(),
            "Delivery processor initialised"
        );

        self.inner = Some(Arc::new(inner));
        Ok(())
    }

    fn inner(&self) -> Result<&Arc<Inner>, DeliveryError> {
        self.inner.as_ref().ok_or_else(|| {
            SystemError::NotInitialised(
                "Delivery processor not initialised. Call init() first.".to_string(),
            )
            .into()
        })
    }

    /// Run the delivery processor
    ///
    /// Every poll interval the recurring schedules are synced and a pass is
    /// started, unless the previous pass is still running. On shutdown the
    /// in-flight pass is given `shutdown_timeout_secs` to finish; anything it
    /// leaves undone stays pending and is picked up after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor was not initialised
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let inner = Arc::clone(self.inner()?);
        let mut timer = tokio::time::interval(inner.settings.poll_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut pass: Option<tokio::task::JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if pass.as_ref().is_some_and(|handle| !handle.is_finished()) {
                        tracing::debug!("Previous delivery pass still running, skipping this tick");
                        continue;
                    }

                    let inner = Arc::clone(&inner);
                    pass = Some(tokio::spawn(async move {
                        let now = now_ms();
                        if let Err(e) = inner.ctx.schedule.sync_campaign_schedules(now).await {
                            tracing::error!("Error syncing campaign schedules: {e}");
                        }

                        match pass::run_pass(&inner, now).await {
                            Ok(report) if report.due > 0 => {
                                tracing::info!(?report, "Delivery pass complete");
                            }
                            Ok(_) => tracing::debug!("Delivery pass found no due entries"),
                            Err(e) => tracing::error!("Error running delivery pass: {e}"),
                        }
                    }));
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Delivery processor received shutdown signal");

                            if let Some(handle) = pass.take() {
                                let timeout = Duration::from_secs(self.shutdown_timeout_secs);
                                match tokio::time::timeout(timeout, handle).await {
                                    Ok(_) => internal!("In-flight delivery pass completed"),
                                    Err(_) => tracing::warn!(
                                        "Shutdown timeout exceeded, entries left pending"
                                    ),
                                }
                            }

                            internal!("Delivery processor shutdown complete");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Delivery processor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Work every entry due at `now` once
    ///
    /// # Errors
    ///
    /// Returns an error if the due entries cannot be read
    pub async fn run_pass(&self, now: Timestamp) -> Result<PassReport, DeliveryError> {
        pass::run_pass(self.inner()?, now).await
    }

    /// Stop a campaign for good: nothing more is dispatched, and every
    /// pending entry not currently in flight is skipped
    ///
    /// # Errors
    ///
    /// Returns an error if the campaign is unknown or already cancelled or
    /// completed
    #[tracing::instrument(skip(self))]
    pub async fn emergency_stop(
        &self,
        campaign_id: CampaignId,
    ) -> Result<StopReport, DeliveryError> {
        let inner = self.inner()?;
        let store = inner.ctx.schedule.backing();

        if store
            .update_campaign_status(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Sending,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Stopped,
            )
            .await?
            .is_none()
        {
            let campaign = store.campaign(campaign_id).await?;
            if campaign.status != CampaignStatus::Stopped {
                return Err(PermanentError::InvalidState {
                    campaign_id,
                    status: campaign.status,
                }
                .into());
            }
        }

        self.queue.retire(campaign_id);

        let skipped = inner
            .ctx
            .schedule
            .skip_pending(campaign_id, self.unclaimed())
            .await?;
        let in_flight = self.queue.claims_for(campaign_id);

        tracing::warn!(
            campaign_id = %campaign_id,
            skipped,
            in_flight = in_flight.len(),
            "Campaign emergency stopped"
        );

        Ok(StopReport { skipped, in_flight })
    }

    /// Accepts the entries no pass is working
    fn unclaimed(&self) -> impl Fn(&ScheduleEntry) -> bool + Send + Sync + use<> {
        let queue = self.queue.clone();
        move |entry| !queue.is_claimed(entry.id)
    }

    /// Halt dispatch and skip the campaign's pending entries that are not in
    /// flight
    ///
    /// # Errors
    ///
    /// Returns an error if the campaign cannot be paused
    pub async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError> {
        let inner = self.inner()?;
        let was_halted = self.queue.is_halted(campaign_id);
        self.queue.halt(campaign_id);
        match inner.ctx.schedule.pause(campaign_id, self.unclaimed()).await {
            Ok(skipped) => Ok(skipped),
            Err(e) => {
                if !was_halted {
                    self.queue.resume(campaign_id);
                }
                Err(e.into())
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the campaign is not paused
    pub async fn resume_campaign(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, DeliveryError> {
        let created = self.inner()?.ctx.schedule.resume(campaign_id, now).await?;
        self.queue.resume(campaign_id);
        Ok(created)
    }

    /// # Errors
    ///
    /// Returns an error if the campaign is already final
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError> {
        let inner = self.inner()?;
        let was_halted = self.queue.is_halted(campaign_id);
        self.queue.halt(campaign_id);
        match inner.ctx.schedule.cancel(campaign_id, self.unclaimed()).await {
            Ok(skipped) => {
                self.queue.retire(campaign_id);
                Ok(skipped)
            }
            Err(e) => {
                if !was_halted {
                    self.queue.resume(campaign_id);
                }
                Err(e.into())
            }
        }
    }

    /// Usage of the user's plan if `count` more emails were sent now
    ///
    /// # Errors
    ///
    /// Returns an error if the plan or send log cannot be read
    pub async fn check_usage(
        &self,
        user: UserId,
        count: u64,
        now: Timestamp,
    ) -> Result<UsageDecision, DeliveryError> {
        let inner = self.inner()?;
        let user = inner.user_config(user).await?;
        inner.usage.check(&user, count, now).await
    }

    /// Get a reference to the delivery queue
    pub const fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// The schedule store the processor was initialised with
    ///
    /// # Errors
    ///
    /// Returns an error if the processor was not initialised
    pub fn schedule(&self) -> Result<&ScheduleStore, DeliveryError> {
        Ok(&self.inner()?.ctx.schedule)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn an_empty_document_is_a_valid_config() {
        let processor: DeliveryProcessor = ron::from_str("()").unwrap();

        assert_eq!(processor.poll_interval_secs, 60);
        assert_eq!(processor.max_concurrent_sends, 8);
        assert_eq!(processor.retry.max_attempts, 3);
        assert_eq!(processor.rate_limit.burst_size, 20);
        assert_eq!(processor.plans.free.monthly, 10);
        assert_eq!(processor.optimizer.top_hours, 3);
    }

    #[test]
    fn nested_sections_override_defaults() {
        let processor: DeliveryProcessor = ron::from_str(
            r#"(
                poll_interval_secs: 5,
                retry: (max_attempts: 5),
                rate_limit: (
                    provider: "ses",
                    providers: { "ses": (messages_per_second: 14.0, burst_size: 14) },
                ),
            )"#,
        )
        .unwrap();

        assert_eq!(processor.poll_interval_secs, 5);
        assert_eq!(processor.retry.max_attempts, 5);
        assert_eq!(processor.retry.base_retry_delay_secs, 60);
        assert_eq!(processor.rate_limit.provider, "ses");
        assert_eq!(processor.rate_limit.providers["ses"].burst_size, 14);
    }

    #[tokio::test]
    async fn serving_requires_init() {
        let processor = DeliveryProcessor::default();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);

        let err = processor.serve(rx).await.unwrap_err();
        assert!(matches!(err, DeliveryError::System(SystemError::NotInitialised(_))));
    }

    #[test]
    fn pass_reports_tally_outcomes() {
        let mut report = PassReport::default();
        report.record(EntryOutcome::Processed {
            recipient_count: 4,
            sent: 3,
        });
        report.record(EntryOutcome::Partial {
            sent: 2,
            outstanding: 5,
        });
        report.record(EntryOutcome::Deferred(Deferral::Weekend));
        report.record(EntryOutcome::Skipped);

        assert_eq!(report.processed, 1);
        assert_eq!(report.partial, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent, 5);
    }
}
