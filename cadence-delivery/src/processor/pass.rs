//! One poll pass over the due schedule entries

use std::{sync::Arc, time::Instant};

use ahash::AHashSet;
use cadence_common::{
    Campaign, CampaignStatus, EntryId, EntryKind, EntryStatus, Recipient, RecipientId,
    ScheduleEntry, ScheduleSettings, SendRecord, Timestamp, UserConfig, internal,
    time::{DAY_MS, HOUR_MS, parse_timezone, to_datetime},
    tracing,
};
use cadence_store::{EntryFilter, Transition};
use chrono::{Datelike, Weekday};
use tokio::task::JoinSet;

use super::{
    Deferral, EntryOutcome, Inner, PassReport,
    dispatch::{self, ContentPlan},
};
use crate::{error::DeliveryError, state::EntryProgress};

/// The pass's notion of time: its start, advanced by real elapsed time
#[derive(Debug, Clone, Copy)]
pub(super) struct PassClock {
    base: Timestamp,
    started: Instant,
}

impl PassClock {
    fn new(base: Timestamp) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    pub(super) fn now(&self) -> Timestamp {
        self.base
            .saturating_add(u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX))
    }
}

enum Batch {
    Send(usize),
    Defer(Deferral),
}

fn spawn_entry(
    join_set: &mut JoinSet<(ScheduleEntry, Result<EntryOutcome, DeliveryError>)>,
    inner: &Arc<Inner>,
    entry: ScheduleEntry,
    clock: PassClock,
) {
    let inner = Arc::clone(inner);
    join_set.spawn(async move {
        let outcome = process_entry(&inner, &entry, clock).await;
        (entry, outcome)
    });
}

/// Work every entry due at `now`, up to `max_concurrent_entries` at once
pub(super) async fn run_pass(
    inner: &Arc<Inner>,
    now: Timestamp,
) -> Result<PassReport, DeliveryError> {
    let clock = PassClock::new(now);
    let due = inner
        .ctx
        .schedule
        .backing()
        .entries(&EntryFilter::due(now))
        .await?;

    let mut report = PassReport {
        due: due.len(),
        ..PassReport::default()
    };

    if due.is_empty() {
        return Ok(report);
    }

    tracing::info!(
        due = due.len(),
        max_concurrent = inner.settings.max_concurrent_entries,
        "Processing due schedule entries"
    );

    let mut join_set = JoinSet::new();
    let mut pending = due.into_iter();

    for entry in pending.by_ref().take(inner.settings.max_concurrent_entries) {
        spawn_entry(&mut join_set, inner, entry, clock);
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((entry, Ok(outcome))) => {
                internal!(level = DEBUG, entry_id = %entry.id, "Entry outcome: {outcome:?}");
                report.record(outcome);
            }
            Ok((entry, Err(e))) => {
                report.errors += 1;
                tracing::warn!(
                    entry_id = %entry.id,
                    campaign_id = %entry.campaign_id,
                    "Entry left pending after error: {e}"
                );
            }
            Err(e) => {
                report.errors += 1;
                tracing::error!("Delivery task failed: {e}");
            }
        }

        if let Some(entry) = pending.next() {
            spawn_entry(&mut join_set, inner, entry, clock);
        }
    }

    Ok(report)
}

async fn process_entry(
    inner: &Arc<Inner>,
    entry: &ScheduleEntry,
    clock: PassClock,
) -> Result<EntryOutcome, DeliveryError> {
    let Some(_claim) = inner.queue.try_claim(entry.id, entry.campaign_id) else {
        internal!(entry_id = %entry.id, "Entry is already being worked by another pass");
        return Ok(EntryOutcome::Busy);
    };

    let store = inner.ctx.schedule.backing();

    // The listing may be stale by the time the claim is held
    let entry = store.entry(entry.id).await?;
    if entry.status.is_terminal() {
        return Ok(EntryOutcome::NoOp);
    }

    let campaign = match store.campaign(entry.campaign_id).await {
        Ok(campaign) => campaign,
        Err(e) if e.is_not_found() => {
            tracing::warn!(
                entry_id = %entry.id,
                campaign_id = %entry.campaign_id,
                "Campaign no longer exists, failing entry"
            );
            return match inner
                .ctx
                .schedule
                .transition(entry.id, EntryStatus::Failed, Some(0), None)
                .await?
            {
                Transition::Applied => Ok(EntryOutcome::Failed),
                Transition::NoOp { .. } => Ok(EntryOutcome::NoOp),
            };
        }
        Err(e) => return Err(e.into()),
    };

    if !campaign.status.is_active() || inner.queue.is_halted(campaign.id) {
        internal!(
            level = INFO,
            entry_id = %entry.id,
            campaign_id = %campaign.id,
            "Campaign is {:?}, skipping entry",
            campaign.status
        );
        return skip(inner, &entry, 0, None).await;
    }

    if campaign.status == CampaignStatus::Scheduled {
        store
            .update_campaign_status(
                campaign.id,
                &[CampaignStatus::Scheduled],
                CampaignStatus::Sending,
            )
            .await?;
    }

    let user = inner.user_config(campaign.user_id).await?;
    let (recipients, plan) = audience(inner, &campaign, &entry).await?;

    if recipients.is_empty() {
        internal!(
            level = INFO,
            entry_id = %entry.id,
            campaign_id = %campaign.id,
            "Entry has no eligible recipients, skipping"
        );
        let outcome = skip(inner, &entry, 0, None).await?;
        complete_if_drained(inner, &campaign).await?;
        return Ok(outcome);
    }

    let records = inner.ctx.log.sends_for_entry(entry.id).await?;
    let started = !records.is_empty();
    let now = clock.now();
    let progress = EntryProgress::derive(recipients, &records, &inner.settings.retry, now);

    if progress.outstanding() == 0 {
        return finalize(
            inner,
            &campaign,
            &entry,
            progress.sent,
            progress.failed,
            0,
            progress.last_sent_at,
            now,
        )
        .await;
    }

    if progress.eligible.is_empty() {
        inner.queue.set_backlog(entry.id, campaign.id, progress.outstanding());
        return Ok(EntryOutcome::Deferred(Deferral::RetryBackoff {
            until: progress.next_retry_at,
        }));
    }

    if let Some(deferral) = deferral(inner, &campaign, &user, &entry, started, now).await? {
        internal!(
            level = DEBUG,
            entry_id = %entry.id,
            "Entry deferred: {deferral:?}"
        );
        inner.queue.set_backlog(entry.id, campaign.id, progress.outstanding());
        return Ok(EntryOutcome::Deferred(deferral));
    }

    let limit = match batch_limit(inner, &campaign, &user, progress.eligible.len(), now).await? {
        Batch::Send(limit) => limit,
        Batch::Defer(deferral) => {
            internal!(
                level = DEBUG,
                entry_id = %entry.id,
                "Entry deferred: {deferral:?}"
            );
            inner.queue.set_backlog(entry.id, campaign.id, progress.outstanding());
            return Ok(EntryOutcome::Deferred(deferral));
        }
    };

    let outstanding = progress.outstanding();
    let mut batch = progress.eligible;

    if campaign.send.optimize_send_time {
        let audience: Vec<Recipient> = batch
            .iter()
            .map(|(recipient, _)| recipient.clone())
            .collect();
        match inner
            .optimizer
            .for_user(inner.ctx.log.as_ref(), campaign.user_id, &audience, now)
            .await
        {
            Ok(windows) => {
                inner
                    .optimizer
                    .order(&mut batch, |(recipient, _)| recipient, &windows, now);
            }
            Err(e) => tracing::warn!(
                campaign_id = %campaign.id,
                "Send-time optimisation unavailable, keeping contact order: {e}"
            ),
        }
    }

    batch.truncate(limit);

    internal!(
        level = DEBUG,
        entry_id = %entry.id,
        campaign_id = %campaign.id,
        "Dispatching {} of {outstanding} outstanding recipients",
        batch.len()
    );

    let dispatched = dispatch::dispatch(inner, &campaign, &user, &entry, plan, batch, clock).await;
    internal!(
        level = DEBUG,
        entry_id = %entry.id,
        "Batch complete: {} sent, {} failed, {} retrying",
        dispatched.sent,
        dispatched.failed,
        dispatched.retrying
    );

    let sent = progress.sent + dispatched.sent;
    let failed = progress.failed + dispatched.failed;
    let remaining = outstanding.saturating_sub(dispatched.sent + dispatched.failed);
    let last_sent_at = progress.last_sent_at.max(dispatched.last_sent_at);

    let status = store.campaign(campaign.id).await?.status;
    let halted = dispatched.halted || inner.queue.is_halted(campaign.id) || status.is_halted();

    if halted && sent == 0 {
        return skip(inner, &entry, 0, None).await;
    }

    // Only undispatched work is dropped. What already went out stands.
    if halted && remaining > 0 && status == CampaignStatus::Paused {
        // The occurrence materialised on resume picks up the remainder
        return skip(inner, &entry, sent, last_sent_at).await;
    }

    if halted || remaining == 0 {
        return finalize(
            inner,
            &campaign,
            &entry,
            sent,
            failed,
            dispatched.sent,
            last_sent_at,
            clock.now(),
        )
        .await;
    }

    inner.queue.set_backlog(entry.id, campaign.id, remaining);
    Ok(EntryOutcome::Partial {
        sent: dispatched.sent,
        outstanding: remaining,
    })
}

/// Recipients of the entry, and where their content comes from
async fn audience(
    inner: &Inner,
    campaign: &Campaign,
    entry: &ScheduleEntry,
) -> Result<(Vec<Recipient>, ContentPlan), DeliveryError> {
    let recipients = inner.ctx.contacts.resolve_recipients(&campaign.tags).await?;
    let campaign_plan = || {
        campaign
            .rollout
            .clone()
            .map_or(ContentPlan::Campaign, ContentPlan::Rollout)
    };

    match entry.kind {
        EntryKind::Scheduled => {
            // A resumed occurrence gets a fresh entry under the same key
            let siblings: AHashSet<EntryId> = inner
                .ctx
                .schedule
                .backing()
                .entries(&EntryFilter::campaign(campaign.id))
                .await?
                .into_iter()
                .filter(|other| {
                    other.id != entry.id
                        && other.kind == EntryKind::Scheduled
                        && other.occurrence == entry.occurrence
                })
                .map(|other| other.id)
                .collect();
            if siblings.is_empty() {
                return Ok((recipients, campaign_plan()));
            }

            let reached = reached_elsewhere(inner, campaign, entry, |record| {
                siblings.contains(&record.entry_id)
            })
            .await?;
            let recipients = recipients
                .into_iter()
                .filter(|recipient| !reached.contains(&recipient.id))
                .collect();
            Ok((recipients, campaign_plan()))
        }
        EntryKind::Variant(variant_id) => {
            let tests = inner.ctx.schedule.backing().tests().await?;
            let Some(variant) = tests
                .iter()
                .filter(|test| test.campaign_id == campaign.id)
                .find_map(|test| test.variant(variant_id))
            else {
                tracing::warn!(
                    entry_id = %entry.id,
                    variant_id = %variant_id,
                    "Variant no longer exists"
                );
                return Ok((Vec::new(), ContentPlan::Campaign));
            };

            // A resumed test gets a fresh entry per variant
            let reached = reached_elsewhere(inner, campaign, entry, |record| {
                record.variant_id == Some(variant_id)
            })
            .await?;
            let recipients = recipients
                .into_iter()
                .filter(|recipient| {
                    variant.assigned_recipients.contains(&recipient.id)
                        && !reached.contains(&recipient.id)
                })
                .collect();
            Ok((
                recipients,
                ContentPlan::Variant(variant.id, variant.content.clone()),
            ))
        }
        EntryKind::Rollout => {
            let reached = reached_elsewhere(inner, campaign, entry, |_| true).await?;
            let recipients = recipients
                .into_iter()
                .filter(|recipient| !reached.contains(&recipient.id))
                .collect();
            Ok((recipients, campaign_plan()))
        }
    }
}

/// Recipients already sent to by other entries of the campaign whose send
/// records `accept` admits
async fn reached_elsewhere<F>(
    inner: &Inner,
    campaign: &Campaign,
    entry: &ScheduleEntry,
    accept: F,
) -> Result<AHashSet<RecipientId>, DeliveryError>
where
    F: Fn(&SendRecord) -> bool,
{
    Ok(inner
        .ctx
        .log
        .sends_for_campaign(campaign.id)
        .await?
        .into_iter()
        .filter(|record| {
            record.outcome.is_sent() && record.entry_id != entry.id && accept(record)
        })
        .map(|record| record.recipient_id)
        .collect())
}

/// Weekend avoidance and the minimum gap between sends, checked only before
/// an entry starts so a partially drained entry is not stranded
async fn deferral(
    inner: &Inner,
    campaign: &Campaign,
    user: &UserConfig,
    entry: &ScheduleEntry,
    started: bool,
    now: Timestamp,
) -> Result<Option<Deferral>, DeliveryError> {
    if started {
        return Ok(None);
    }

    if campaign.send.avoid_weekends {
        let timezone = match &campaign.schedule {
            ScheduleSettings::Recurring(rule) => Some(rule.timezone.as_str()),
            _ => user.timezone.as_deref(),
        };
        let tz = parse_timezone(timezone).unwrap_or(chrono_tz::Tz::UTC);
        if matches!(
            to_datetime(now).with_timezone(&tz).weekday(),
            Weekday::Sat | Weekday::Sun
        ) {
            return Ok(Some(Deferral::Weekend));
        }
    }

    if let Some(hours) = campaign.send.min_hours_between.filter(|hours| *hours > 0) {
        let previous = inner
            .ctx
            .schedule
            .backing()
            .entries(&EntryFilter::campaign(campaign.id).with_status(EntryStatus::Processed))
            .await?
            .into_iter()
            .filter(|other| other.id != entry.id)
            .filter_map(|other| other.actual_sent_at)
            .max();

        if let Some(previous) = previous {
            let until = previous.saturating_add(u64::from(hours) * HOUR_MS);
            if now < until {
                return Ok(Some(Deferral::MinGap { until }));
            }
        }
    }

    Ok(None)
}

/// How many recipients may be dispatched now
async fn batch_limit(
    inner: &Inner,
    campaign: &Campaign,
    user: &UserConfig,
    eligible: usize,
    now: Timestamp,
) -> Result<Batch, DeliveryError> {
    let mut limit = u64::try_from(eligible.min(inner.settings.max_batch_size)).unwrap_or(u64::MAX);

    if let Some(rate) = campaign.send_rate() {
        for (cap, span) in [(rate.emails_per_hour, HOUR_MS), (rate.emails_per_day, DAY_MS)] {
            let Some(cap) = cap else { continue };
            let sent = inner
                .ctx
                .log
                .count_campaign_sent(campaign.id, now.saturating_sub(span), now + 1)
                .await?;
            limit = limit.min(cap.saturating_sub(sent));
        }

        if limit == 0 {
            return Ok(Batch::Defer(Deferral::SendRate));
        }
    }

    let headroom = inner.usage.headroom(user, now).await?;
    if headroom == 0 {
        return Ok(Batch::Defer(Deferral::PlanLimit));
    }
    limit = limit.min(headroom);

    // Keep a pass within one poll interval
    let delay_ms = dispatch::send_delay_ms(inner, campaign);
    if delay_ms > 0 {
        let poll_ms = u64::try_from(inner.settings.poll_interval.as_millis()).unwrap_or(u64::MAX);
        let per_poll = poll_ms / delay_ms;
        limit = limit.min(per_poll.max(1));
    }

    Ok(Batch::Send(usize::try_from(limit).unwrap_or(usize::MAX)))
}

/// Skip the entry, keeping the count of sends it made before it was halted
async fn skip(
    inner: &Inner,
    entry: &ScheduleEntry,
    sent: u64,
    last_sent_at: Option<Timestamp>,
) -> Result<EntryOutcome, DeliveryError> {
    inner.queue.clear_backlog(entry.id);
    match inner
        .ctx
        .schedule
        .transition(entry.id, EntryStatus::Skipped, Some(sent), last_sent_at)
        .await?
    {
        Transition::Applied => Ok(EntryOutcome::Skipped),
        Transition::NoOp { .. } => Ok(EntryOutcome::NoOp),
    }
}

/// Every recipient has a terminal outcome: the entry is processed with the
/// successful sends as its recipient count, or failed if nothing went out
#[allow(clippy::too_many_arguments)]
async fn finalize(
    inner: &Inner,
    campaign: &Campaign,
    entry: &ScheduleEntry,
    sent: u64,
    failed: u64,
    sent_this_pass: u64,
    last_sent_at: Option<Timestamp>,
    now: Timestamp,
) -> Result<EntryOutcome, DeliveryError> {
    inner.queue.clear_backlog(entry.id);

    let status = if sent == 0 && failed > 0 {
        EntryStatus::Failed
    } else {
        EntryStatus::Processed
    };

    let transition = inner
        .ctx
        .schedule
        .transition(entry.id, status, Some(sent), Some(last_sent_at.unwrap_or(now)))
        .await?;

    if let Transition::NoOp { current } = transition {
        internal!(entry_id = %entry.id, "Entry became {current} while it was being worked");
        return Ok(EntryOutcome::NoOp);
    }

    tracing::info!(
        entry_id = %entry.id,
        campaign_id = %campaign.id,
        sent,
        failed,
        "Entry is now {status}"
    );

    complete_if_drained(inner, campaign).await?;

    Ok(if status == EntryStatus::Failed {
        EntryOutcome::Failed
    } else {
        EntryOutcome::Processed {
            recipient_count: sent,
            sent: sent_this_pass,
        }
    })
}

/// A campaign with no recurrence is complete once none of its entries are
/// pending
async fn complete_if_drained(inner: &Inner, campaign: &Campaign) -> Result<(), DeliveryError> {
    if matches!(campaign.schedule, ScheduleSettings::Recurring(_)) {
        return Ok(());
    }

    let store = inner.ctx.schedule.backing();
    let pending = store
        .entries(&EntryFilter::campaign(campaign.id).with_status(EntryStatus::Pending))
        .await?;

    if pending.is_empty()
        && store
            .update_campaign_status(
                campaign.id,
                &[CampaignStatus::Scheduled, CampaignStatus::Sending],
                CampaignStatus::Completed,
            )
            .await?
            .is_some()
    {
        tracing::info!(campaign_id = %campaign.id, "Campaign completed");
    }

    Ok(())
}
