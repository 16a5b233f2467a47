use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use cadence_common::{
    AlertSeverity, CampaignId, CampaignStatus, EntryStatus, Signal, Timestamp, UserId, internal,
    time::now_ms, tracing,
};
use cadence_delivery::DeliveryQueryService;
use cadence_store::{BackingStore, EntryFilter, EventLog, StoreError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    alerts::{AlertHistory, AlertTrigger, evaluate},
    config::HealthThresholds,
    error::MonitorError,
    health::{CampaignBadge, HealthIssue, HealthStatus},
    stats::{RealTimeStats, compute},
};

const fn default_alert_retention() -> u64 {
    3600
}

const fn default_alert_history_capacity() -> usize {
    1000
}

const fn default_evaluation_interval() -> u64 {
    60
}

/// What the monitor reads from
#[derive(Clone)]
pub struct MonitorContext {
    pub store: Arc<dyn BackingStore>,
    pub log: Arc<dyn EventLog>,
    pub delivery: Arc<dyn DeliveryQueryService>,
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("store", &self.store)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

/// Statistics as of `computed_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: RealTimeStats,
    pub computed_at: Timestamp,
    /// The event log could not be read, these are the last known statistics
    pub stale: bool,
}

#[derive(Debug)]
struct State {
    ctx: MonitorContext,
    history: AlertHistory,
    last_known: DashMap<CampaignId, (RealTimeStats, Timestamp)>,
}

/// Real-time monitor
///
/// Statistics are recomputed on every read. The last successful computation
/// per campaign is kept so reads can fall back to it while the event log is
/// unreachable.
#[derive(Debug, Deserialize)]
pub struct Monitor {
    #[serde(default)]
    pub thresholds: HealthThresholds,

    /// How long fired alerts are remembered (in seconds)
    ///
    /// Default: 3600 seconds
    #[serde(default = "default_alert_retention")]
    pub alert_retention_secs: u64,

    /// Most fired alerts remembered at once
    ///
    /// Default: 1000
    #[serde(default = "default_alert_history_capacity")]
    pub alert_history_capacity: usize,

    /// How often alert rules are evaluated in the background (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Initialised in `init()`
    #[serde(skip)]
    state: Option<State>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            alert_retention_secs: default_alert_retention(),
            alert_history_capacity: default_alert_history_capacity(),
            evaluation_interval_secs: default_evaluation_interval(),
            state: None,
        }
    }
}

impl Monitor {
    /// Initialise the monitor
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is not a fraction or an interval or
    /// capacity is zero
    pub fn init(&mut self, ctx: MonitorContext) -> Result<(), MonitorError> {
        internal!("Initialising Monitor ...");

        let t = &self.thresholds;
        for (name, value) in [
            ("critical_bounce_rate", t.critical_bounce_rate),
            ("critical_complaint_rate", t.critical_complaint_rate),
            ("warning_delivery_rate", t.warning_delivery_rate),
            ("low_open_rate", t.low_open_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MonitorError::Config(format!(
                    "{name} must lie between 0 and 1, got {value}"
                )));
            }
        }

        if self.evaluation_interval_secs == 0 {
            return Err(MonitorError::Config(
                "evaluation_interval_secs must be positive".to_string(),
            ));
        }
        if self.alert_history_capacity == 0 {
            return Err(MonitorError::Config(
                "alert_history_capacity must be positive".to_string(),
            ));
        }

        self.state = Some(State {
            ctx,
            history: AlertHistory::new(
                self.alert_history_capacity,
                self.alert_retention_secs.saturating_mul(1000),
            ),
            last_known: DashMap::new(),
        });
        Ok(())
    }

    fn state(&self) -> Result<&State, MonitorError> {
        self.state.as_ref().ok_or(MonitorError::NotInitialised)
    }

    /// Current statistics of a campaign
    ///
    /// # Errors
    ///
    /// Returns an error if the campaign is unknown, or if the event log is
    /// unreachable and the campaign was never computed before
    pub async fn real_time_stats(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<Snapshot, MonitorError> {
        let state = self.state()?;
        state.ctx.store.campaign(campaign_id).await?;

        let read = async {
            let sends = state.ctx.log.sends_for_campaign(campaign_id).await?;
            let events = state.ctx.log.engagements(campaign_id).await?;
            Ok::<_, StoreError>((sends, events))
        };

        match read.await {
            Ok((sends, events)) => {
                let stats = compute(
                    campaign_id,
                    &sends,
                    &events,
                    state.ctx.delivery.queued_for(campaign_id),
                    &self.thresholds,
                    now,
                );
                state.last_known.insert(campaign_id, (stats.clone(), now));

                Ok(Snapshot {
                    stats,
                    computed_at: now,
                    stale: false,
                })
            }
            Err(source) => {
                let Some(cached) = state.last_known.get(&campaign_id) else {
                    return Err(MonitorError::Unavailable {
                        campaign_id,
                        source,
                    });
                };

                let (stats, computed_at) = cached.value().clone();
                tracing::warn!(
                    campaign_id = %campaign_id,
                    computed_at,
                    "Serving stale statistics: {source}"
                );
                Ok(Snapshot {
                    stats,
                    computed_at,
                    stale: true,
                })
            }
        }
    }

    /// Evaluate the user's enabled rules against each of their sending or
    /// scheduled campaigns. Every firing is returned and remembered.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules or campaigns cannot be read
    #[tracing::instrument(skip(self))]
    pub async fn alert_triggers(
        &self,
        user: UserId,
        now: Timestamp,
    ) -> Result<Vec<AlertTrigger>, MonitorError> {
        let state = self.state()?;

        let rules: Vec<_> = state
            .ctx
            .store
            .alert_rules(user)
            .await?
            .into_iter()
            .filter(|rule| rule.enabled)
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let campaigns: Vec<_> = state
            .ctx
            .store
            .campaigns()
            .await?
            .into_iter()
            .filter(|campaign| campaign.user_id == user && campaign.status.is_active())
            .collect();

        let mut triggers = Vec::new();
        for campaign in &campaigns {
            let snapshot = match self.real_time_stats(campaign.id, now).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(campaign_id = %campaign.id, "Skipping alert evaluation: {e}");
                    continue;
                }
            };

            for rule in &rules {
                if let Some(trigger) = evaluate(rule, &snapshot.stats, now) {
                    state.history.record(trigger.clone());
                    triggers.push(trigger);
                }
            }
        }

        Ok(triggers)
    }

    /// Alerts fired for the user within the retention window
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor is not initialised
    pub fn recent_triggers(
        &self,
        user: UserId,
        now: Timestamp,
    ) -> Result<Vec<AlertTrigger>, MonitorError> {
        Ok(self.state()?.history.recent(user, now))
    }

    /// The worst unresolved issue of a campaign, across its schedule entries
    /// and its current health
    ///
    /// # Errors
    ///
    /// Returns an error if the campaign or its entries cannot be read
    pub async fn campaign_badge(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<CampaignBadge, MonitorError> {
        let state = self.state()?;
        let campaign = state.ctx.store.campaign(campaign_id).await?;

        let mut issues = Vec::new();
        if campaign.status == CampaignStatus::Stopped {
            issues.push(HealthIssue::Stopped);
        }

        let failed = state
            .ctx
            .store
            .entries(&EntryFilter::campaign(campaign_id).with_status(EntryStatus::Failed))
            .await?
            .len() as u64;
        if failed > 0 {
            issues.push(HealthIssue::FailedEntries { count: failed });
        }

        let stale = match self.real_time_stats(campaign_id, now).await {
            Ok(snapshot) => {
                issues.extend(snapshot.stats.health.issues);
                snapshot.stale
            }
            Err(MonitorError::Unavailable { .. }) => true,
            Err(e) => return Err(e),
        };

        Ok(CampaignBadge {
            status: issues
                .iter()
                .map(HealthIssue::status)
                .max()
                .unwrap_or(HealthStatus::Good),
            issues,
            stale,
        })
    }

    /// Evaluate every user's alert rules on a timer until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor is not initialised
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), MonitorError> {
        internal!("Monitor starting");

        let store = Arc::clone(&self.state()?.ctx.store);
        let mut timer = tokio::time::interval(Duration::from_secs(self.evaluation_interval_secs));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let campaigns = match store.campaigns().await {
                        Ok(campaigns) => campaigns,
                        Err(e) => {
                            tracing::error!("Error listing campaigns for alerting: {e}");
                            continue;
                        }
                    };

                    let users: AHashSet<UserId> = campaigns
                        .iter()
                        .filter(|campaign| campaign.status.is_active())
                        .map(|campaign| campaign.user_id)
                        .collect();

                    for user in users {
                        match self.alert_triggers(user, now_ms()).await {
                            Ok(triggers) => {
                                for trigger in triggers {
                                    log_trigger(&trigger);
                                }
                            }
                            Err(e) => {
                                tracing::error!(user_id = %user, "Error evaluating alerts: {e}");
                            }
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Monitor received shutdown signal");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Monitor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn log_trigger(trigger: &AlertTrigger) {
    match trigger.severity {
        AlertSeverity::Critical => tracing::error!(
            campaign_id = %trigger.campaign_id,
            rule_id = %trigger.rule_id,
            "Alert: {}",
            trigger.message
        ),
        AlertSeverity::Warning => tracing::warn!(
            campaign_id = %trigger.campaign_id,
            rule_id = %trigger.rule_id,
            "Alert: {}",
            trigger.message
        ),
    }
}
