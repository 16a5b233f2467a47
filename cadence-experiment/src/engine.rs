//! The A/B test lifecycle
//!
//! `draft -> active -> {completed, paused -> active}`. Every write to a test
//! is a compare-and-swap on its version, so a winner is declared exactly
//! once no matter how many analyses or users race to declare one.

use std::{sync::Arc, time::Duration};

use cadence_common::{
    AbTest, Campaign, CampaignId, CampaignStatus, Contacts, EntryKind, EntryStatus, RecipientId,
    Rollout, ScheduleEntry, ScheduleSettings, Signal, TestConfiguration, TestId, TestStatus,
    Timestamp, Variant, VariantId, internal, time::now_ms, tracing,
};
use cadence_store::{EntryFilter, EventLog, ScheduleError, ScheduleStore};
use serde::{Deserialize, Serialize};

use crate::{
    assignment::{assign_recipients, validate_partition},
    error::ExperimentError,
    stats::{VariantResult, variant_metrics, variant_results},
};

const fn default_analysis_interval() -> u64 {
    60
}

/// Storage and collaborators the engine works against
#[derive(Clone)]
pub struct ExperimentContext {
    pub schedule: ScheduleStore,
    pub log: Arc<dyn EventLog>,
    pub contacts: Arc<dyn Contacts>,
}

impl std::fmt::Debug for ExperimentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentContext")
            .field("schedule", &self.schedule)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

/// Outcome of a significance check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAnalysis {
    pub test_id: TestId,
    /// Status after the analysis, `completed` if it declared a winner
    pub status: TestStatus,
    /// Control first
    pub results: Vec<VariantResult>,
    /// Variants significantly better than the control on the primary metric
    pub significant: Vec<VariantId>,
    pub winner: Option<VariantId>,
    /// This analysis declared the winner
    pub auto_declared: bool,
}

/// A/B test engine
///
/// Tests are delivered through one schedule entry per variant, which the
/// delivery processor sends to that variant's recipients only. While a test
/// is running the campaign's regular schedule is not materialised.
#[derive(Debug, Deserialize)]
pub struct ExperimentEngine {
    /// How often active tests are checked for significance (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,

    /// Initialised in `init()`
    #[serde(skip)]
    ctx: Option<ExperimentContext>,
}

impl Default for ExperimentEngine {
    fn default() -> Self {
        Self {
            analysis_interval_secs: default_analysis_interval(),
            ctx: None,
        }
    }
}

impl ExperimentEngine {
    /// Initialise the experiment engine
    ///
    /// # Errors
    ///
    /// Returns an error if the analysis interval is zero
    pub fn init(&mut self, ctx: ExperimentContext) -> Result<(), ExperimentError> {
        internal!("Initialising Experiment Engine ...");

        if self.analysis_interval_secs == 0 {
            return Err(ExperimentError::Config(
                "analysis_interval_secs must be positive".to_string(),
            ));
        }

        self.ctx = Some(ctx);
        Ok(())
    }

    fn ctx(&self) -> Result<&ExperimentContext, ExperimentError> {
        self.ctx.as_ref().ok_or(ExperimentError::NotInitialised)
    }

    pub async fn test(&self, test_id: TestId) -> Result<AbTest, ExperimentError> {
        Ok(self.ctx()?.schedule.backing().test(test_id).await?)
    }

    /// All tests, or those of one campaign
    pub async fn tests(
        &self,
        campaign: Option<CampaignId>,
    ) -> Result<Vec<AbTest>, ExperimentError> {
        Ok(self
            .ctx()?
            .schedule
            .backing()
            .tests()
            .await?
            .into_iter()
            .filter(|test| campaign.is_none_or(|id| test.campaign_id == id))
            .collect())
    }

    async fn audience(&self, campaign: &Campaign) -> Result<Vec<RecipientId>, ExperimentError> {
        Ok(self
            .ctx()?
            .contacts
            .resolve_recipients(&campaign.tags)
            .await?
            .into_iter()
            .map(|recipient| recipient.id)
            .collect())
    }

    /// Create a draft test over the campaign's current audience
    #[tracing::instrument(skip(self, variants, configuration))]
    pub async fn create(
        &self,
        campaign_id: CampaignId,
        name: String,
        mut variants: Vec<Variant>,
        configuration: TestConfiguration,
        now: Timestamp,
    ) -> Result<AbTest, ExperimentError> {
        let store = self.ctx()?.schedule.backing();

        let confidence = configuration.statistical_settings.confidence_level;
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(ExperimentError::Config(format!(
                "confidence level {confidence} must lie strictly between 0 and 1"
            )));
        }
        if variants.len() < 2 {
            return Err(ExperimentError::Config(
                "a test needs a control and at least one other variant".to_string(),
            ));
        }

        let campaign = store.campaign(campaign_id).await?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(campaign_state(&campaign));
        }

        if store
            .tests()
            .await?
            .iter()
            .any(|test| test.campaign_id == campaign_id && test.status != TestStatus::Completed)
        {
            return Err(ExperimentError::Config(format!(
                "campaign {campaign_id} already has an open test"
            )));
        }

        let audience = self.audience(&campaign).await?;
        let weights: Vec<u32> = variants.iter().map(|variant| variant.weight).collect();
        assign_recipients(&audience, &mut variants, &weights)?;
        validate_partition(&variants, &audience)?;

        let test = AbTest::new(campaign_id, name, variants, configuration, now);
        store.insert_test(&test).await?;

        internal!(
            level = INFO,
            test_id = %test.id,
            "Created test with {} variants over {} recipients",
            test.variants.len(),
            audience.len()
        );
        Ok(test)
    }

    /// Start a draft test: assign recipients who joined the audience since
    /// creation, validate the partition and materialise one entry per variant
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, test_id: TestId, now: Timestamp) -> Result<AbTest, ExperimentError> {
        let ctx = self.ctx()?;
        let store = ctx.schedule.backing();

        let mut test = store.test(test_id).await?;
        if test.status != TestStatus::Draft {
            return Err(ExperimentError::InvalidState {
                test_id,
                status: test.status,
            });
        }

        let campaign = store.campaign(test.campaign_id).await?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(campaign_state(&campaign));
        }

        let audience = self.audience(&campaign).await?;
        let weights: Vec<u32> = test.variants.iter().map(|variant| variant.weight).collect();
        let added = assign_recipients(&audience, &mut test.variants, &weights)?;
        validate_partition(&test.variants, &audience)?;
        if added > 0 {
            internal!(test_id = %test_id, "Assigned {added} recipients who joined since creation");
        }

        test.status = TestStatus::Active;
        test.started_at = Some(now);
        let test = self.swap(&test).await?;

        store
            .update_campaign_status(
                campaign.id,
                &[CampaignStatus::Draft],
                CampaignStatus::Scheduled,
            )
            .await?;

        let replaced = ctx
            .schedule
            .skip_pending(campaign.id, |entry| entry.kind == EntryKind::Scheduled)
            .await?;
        if replaced > 0 {
            internal!(
                level = DEBUG,
                test_id = %test_id,
                "Skipped {replaced} regular entries in favour of the test"
            );
        }

        let at = match campaign.schedule {
            ScheduleSettings::Once { at } => at.max(now),
            ScheduleSettings::Immediate | ScheduleSettings::Recurring(_) => now,
        };
        self.ensure_variant_entries(&test, at, now).await?;

        internal!(level = INFO, test_id = %test_id, "Test started");
        Ok(test)
    }

    /// Pause an active test; its pending variant entries are skipped
    #[tracing::instrument(skip(self))]
    pub async fn pause(&self, test_id: TestId) -> Result<AbTest, ExperimentError> {
        let ctx = self.ctx()?;
        let mut test = ctx.schedule.backing().test(test_id).await?;
        match test.status {
            TestStatus::Paused => return Ok(test),
            TestStatus::Active => {}
            status => return Err(ExperimentError::InvalidState { test_id, status }),
        }

        test.status = TestStatus::Paused;
        let test = self.swap(&test).await?;

        let skipped = ctx
            .schedule
            .skip_pending(test.campaign_id, |entry| owns(&test, entry, None))
            .await?;
        internal!(
            level = INFO,
            test_id = %test_id,
            "Test paused, skipped {skipped} variant entries"
        );
        Ok(test)
    }

    /// Resume a paused test. Variants whose entry was skipped by the pause
    /// get a fresh one, which only sends to recipients not yet reached.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, test_id: TestId, now: Timestamp) -> Result<AbTest, ExperimentError> {
        let ctx = self.ctx()?;
        let store = ctx.schedule.backing();

        let mut test = store.test(test_id).await?;
        match test.status {
            TestStatus::Active => return Ok(test),
            TestStatus::Paused => {}
            status => return Err(ExperimentError::InvalidState { test_id, status }),
        }

        test.status = TestStatus::Active;
        let test = self.swap(&test).await?;

        if store.campaign(test.campaign_id).await?.status.is_active() {
            self.ensure_variant_entries(&test, now, now).await?;
        }

        internal!(level = INFO, test_id = %test_id, "Test resumed");
        Ok(test)
    }

    /// Compare every variant against the control on the primary metric.
    ///
    /// Only ever writes when the test is active, `automatic_winner` is set
    /// and exactly one variant is significantly better than the control.
    #[tracing::instrument(skip(self))]
    pub async fn analyze(
        &self,
        test_id: TestId,
        now: Timestamp,
    ) -> Result<TestAnalysis, ExperimentError> {
        let ctx = self.ctx()?;
        let test = ctx.schedule.backing().test(test_id).await?;

        let sends = ctx.log.sends_for_campaign(test.campaign_id).await?;
        let events = ctx.log.engagements(test.campaign_id).await?;
        let results = variant_results(&test, &variant_metrics(&test, &sends, &events));

        let primary = test.configuration.success_metrics.primary;
        let control_rate = results
            .iter()
            .find(|result| result.is_control)
            .map(|control| control.rates.get(primary));
        let significant: Vec<VariantId> = results
            .iter()
            .filter(|result| {
                result.analysis.statistical_significance
                    && control_rate.is_some_and(|control| result.rates.get(primary) > control)
            })
            .map(|result| result.variant_id)
            .collect();

        let mut analysis = TestAnalysis {
            test_id,
            status: test.status,
            results,
            significant,
            winner: test.winning_variant_id,
            auto_declared: false,
        };

        if test.status != TestStatus::Active
            || !test.configuration.statistical_settings.automatic_winner
        {
            return Ok(analysis);
        }

        match analysis.significant.as_slice() {
            [] => {}
            [winner] => match self.declare_winner(test_id, *winner, now).await {
                Ok(declared) => {
                    analysis.status = declared.status;
                    analysis.winner = declared.winning_variant_id;
                    analysis.auto_declared = true;
                }
                Err(err) if err.is_rejection() => {
                    internal!(
                        level = DEBUG,
                        test_id = %test_id,
                        "Automatic winner not declared: {err}"
                    );
                    let current = ctx.schedule.backing().test(test_id).await?;
                    analysis.status = current.status;
                    analysis.winner = current.winning_variant_id;
                }
                Err(err) => return Err(err),
            },
            several => {
                internal!(
                    level = INFO,
                    test_id = %test_id,
                    "{} variants are significant, a winner must be chosen manually",
                    several.len()
                );
            }
        }

        Ok(analysis)
    }

    /// Complete the test with `variant_id` as winner. The first writer wins;
    /// repeating the same declaration is a no-op. Pending entries of the
    /// other variants are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn declare_winner(
        &self,
        test_id: TestId,
        variant_id: VariantId,
        now: Timestamp,
    ) -> Result<AbTest, ExperimentError> {
        let ctx = self.ctx()?;
        let store = ctx.schedule.backing();

        let test = loop {
            let mut test = store.test(test_id).await?;

            if let Some(winner) = test.winning_variant_id {
                if winner == variant_id {
                    return Ok(test);
                }
                return Err(ExperimentError::AlreadyDeclared { test_id, winner });
            }
            if !matches!(test.status, TestStatus::Active | TestStatus::Paused) {
                return Err(ExperimentError::InvalidState {
                    test_id,
                    status: test.status,
                });
            }
            if test.variant(variant_id).is_none() {
                return Err(ExperimentError::UnknownVariant {
                    test_id,
                    variant_id,
                });
            }

            test.status = TestStatus::Completed;
            test.winning_variant_id = Some(variant_id);
            test.completed_at = Some(now);

            match store.compare_and_swap_test(&test).await {
                Ok(test) => break test,
                Err(err) if err.is_conflict() => {
                    internal!(test_id = %test_id, "Lost a race declaring the winner, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        };

        let skipped = ctx
            .schedule
            .skip_pending(test.campaign_id, |entry| {
                owns(&test, entry, Some(variant_id))
            })
            .await?;

        internal!(
            level = INFO,
            test_id = %test_id,
            variant_id = %variant_id,
            "Winner declared, skipped {skipped} entries of losing variants"
        );

        self.complete_if_drained(test.campaign_id).await?;
        Ok(test)
    }

    /// Direct remaining and future sends of the campaign to the winner's
    /// content. `percentage` of recipients, chosen by a stable hash, get the
    /// winner; the rest get the campaign's own content. Recipients the test
    /// did not reach are sent to through a single rollout entry.
    #[tracing::instrument(skip(self))]
    pub async fn rollout_winner(
        &self,
        test_id: TestId,
        percentage: u8,
        now: Timestamp,
    ) -> Result<ScheduleEntry, ExperimentError> {
        if percentage > 100 {
            return Err(ExperimentError::Config(format!(
                "rollout percentage {percentage} exceeds 100"
            )));
        }

        let ctx = self.ctx()?;
        let store = ctx.schedule.backing();

        let test = store.test(test_id).await?;
        if test.status != TestStatus::Completed {
            return Err(ExperimentError::InvalidState {
                test_id,
                status: test.status,
            });
        }
        let winner_id = test
            .winning_variant_id
            .ok_or(ExperimentError::NoWinner(test_id))?;
        let winner = test
            .variant(winner_id)
            .ok_or(ExperimentError::UnknownVariant {
                test_id,
                variant_id: winner_id,
            })?;

        let campaign = store.campaign(test.campaign_id).await?;
        if campaign.status.is_halted() {
            return Err(campaign_state(&campaign));
        }

        store
            .set_campaign_rollout(
                campaign.id,
                Some(Rollout {
                    test_id,
                    variant_id: winner_id,
                    content: winner.content.clone(),
                    percentage,
                }),
            )
            .await?;

        store
            .update_campaign_status(
                campaign.id,
                &[CampaignStatus::Scheduled, CampaignStatus::Completed],
                CampaignStatus::Sending,
            )
            .await?;

        let entry = ctx
            .schedule
            .ensure_entry(
                campaign.id,
                EntryKind::Rollout,
                format!("rollout:{test_id}"),
                now,
                now,
            )
            .await?;

        internal!(
            level = INFO,
            test_id = %test_id,
            entry_id = %entry.id,
            "Rolling out {} to {percentage}% of remaining sends",
            winner.name
        );
        Ok(entry)
    }

    /// Run the periodic significance check for active tests
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was not initialised
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ExperimentError> {
        internal!("Experiment engine starting");

        let store = Arc::clone(self.ctx()?.schedule.backing());
        let mut timer = tokio::time::interval(Duration::from_secs(self.analysis_interval_secs));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let tests = match store.tests().await {
                        Ok(tests) => tests,
                        Err(e) => {
                            tracing::error!("Error listing tests for analysis: {e}");
                            continue;
                        }
                    };

                    for test in tests.iter().filter(|test| test.status == TestStatus::Active) {
                        match self.analyze(test.id, now_ms()).await {
                            Ok(analysis) if analysis.auto_declared => tracing::info!(
                                test_id = %test.id,
                                winner = ?analysis.winner,
                                "Test reached significance"
                            ),
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(test_id = %test.id, "Error analysing test: {e}");
                            }
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Experiment engine received shutdown signal");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Experiment engine shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn ensure_variant_entries(
        &self,
        test: &AbTest,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<(), ExperimentError> {
        let schedule = &self.ctx()?.schedule;
        for variant in &test.variants {
            schedule
                .ensure_entry(
                    test.campaign_id,
                    EntryKind::Variant(variant.id),
                    format!("variant:{}", variant.id),
                    at,
                    now,
                )
                .await?;
        }
        Ok(())
    }

    /// Write a status change, reporting a concurrent write as the state the
    /// test is now in
    async fn swap(&self, test: &AbTest) -> Result<AbTest, ExperimentError> {
        let store = self.ctx()?.schedule.backing();
        match store.compare_and_swap_test(test).await {
            Ok(test) => Ok(test),
            Err(err) if err.is_conflict() => {
                let current = store.test(test.id).await?;
                Err(ExperimentError::InvalidState {
                    test_id: test.id,
                    status: current.status,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A one-off campaign whose last pending entry was skipped is done
    async fn complete_if_drained(&self, campaign_id: CampaignId) -> Result<(), ExperimentError> {
        let store = self.ctx()?.schedule.backing();
        let campaign = store.campaign(campaign_id).await?;
        if matches!(campaign.schedule, ScheduleSettings::Recurring(_)) {
            return Ok(());
        }

        let pending = store
            .entries(&EntryFilter::campaign(campaign_id).with_status(EntryStatus::Pending))
            .await?;
        if pending.is_empty() {
            store
                .update_campaign_status(
                    campaign_id,
                    &[CampaignStatus::Scheduled, CampaignStatus::Sending],
                    CampaignStatus::Completed,
                )
                .await?;
        }
        Ok(())
    }
}

/// Whether `entry` delivers one of the test's variants, other than `except`
fn owns(test: &AbTest, entry: &ScheduleEntry, except: Option<VariantId>) -> bool {
    matches!(
        entry.kind,
        EntryKind::Variant(id) if test.variant(id).is_some() && except != Some(id)
    )
}

fn campaign_state(campaign: &Campaign) -> ExperimentError {
    ScheduleError::InvalidState {
        campaign_id: campaign.id,
        status: campaign.status,
    }
    .into()
}
