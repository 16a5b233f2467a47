//! Per-recipient sends for one batch of an entry

use std::{collections::HashMap, sync::Arc, time::Duration};

use cadence_common::{
    Campaign, CollaboratorError, ContentRef, EntryId, Recipient, Rollout, ScheduleEntry,
    SendId, SendOutcome, SendRecord, SendResult, Timestamp, UserConfig, VariantId, internal,
    outgoing, tracing,
};
use tokio::task::JoinSet;

use super::{Inner, pass::PassClock};
use crate::error::TemporaryError;

/// Where the content of each send comes from
#[derive(Debug, Clone)]
pub(super) enum ContentPlan {
    Campaign,
    Variant(VariantId, ContentRef),
    /// A share of the audience, chosen by a stable hash of the recipient,
    /// gets the winning variant's content
    Rollout(Rollout),
}

impl ContentPlan {
    fn content_for(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
    ) -> (Option<VariantId>, ContentRef) {
        match self {
            Self::Campaign => (None, campaign.content.clone()),
            Self::Variant(variant_id, content) => (Some(*variant_id), content.clone()),
            Self::Rollout(rollout) => {
                let hash = ahash::RandomState::with_seeds(
                    0x5851_f42d_4c95_7f2d,
                    0x1405_7b7e_f767_814f,
                    0x2545_f491_4f6c_dd1d,
                    0x9e37_79b9_7f4a_7c15,
                )
                .hash_one(recipient.id.as_str());
                let bucket = hash % 100;

                if bucket < u64::from(rollout.percentage) {
                    (Some(rollout.variant_id), rollout.content.clone())
                } else {
                    (None, campaign.content.clone())
                }
            }
        }
    }
}

/// Inter-email delay for the campaign, falling back to the processor's
pub(super) const fn send_delay_ms(inner: &Inner, campaign: &Campaign) -> u64 {
    if campaign.send.send_delay_ms > 0 {
        campaign.send.send_delay_ms
    } else {
        inner.settings.send_delay_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStatus {
    Sent(Timestamp),
    Retrying,
    FailedPermanently,
    /// The campaign was halted before the send went out
    Halted,
    /// The plan cap was reached before the send went out
    Capacity,
    /// The send went out but could not be recorded, or usage could not be read
    Error,
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct DispatchReport {
    pub sent: u64,
    /// Recipients that failed for good
    pub failed: u64,
    pub retrying: u64,
    pub halted: bool,
    pub capacity: bool,
    pub last_sent_at: Option<Timestamp>,
}

impl DispatchReport {
    fn record(&mut self, status: SendStatus) {
        match status {
            SendStatus::Sent(at) => {
                self.sent += 1;
                self.last_sent_at = self.last_sent_at.max(Some(at));
            }
            SendStatus::Retrying => self.retrying += 1,
            SendStatus::FailedPermanently => self.failed += 1,
            SendStatus::Halted => self.halted = true,
            SendStatus::Capacity => self.capacity = true,
            SendStatus::Error => {}
        }
    }

    const fn stopped(&self) -> bool {
        self.halted || self.capacity
    }
}

struct SendJob {
    campaign: Arc<Campaign>,
    user: Arc<UserConfig>,
    entry_id: EntryId,
    plan: Arc<ContentPlan>,
    recipient: Recipient,
    attempt: u32,
}

/// Send to every recipient of the batch, with at most
/// `max_concurrent_sends` in flight and the campaign's delay between
/// dispatches. Dispatch stops early once the campaign is halted or the
/// plan cap is hit; sends already in flight are left to complete.
pub(super) async fn dispatch(
    inner: &Arc<Inner>,
    campaign: &Campaign,
    user: &UserConfig,
    entry: &ScheduleEntry,
    plan: ContentPlan,
    batch: Vec<(Recipient, u32)>,
    clock: PassClock,
) -> DispatchReport {
    let campaign = Arc::new(campaign.clone());
    let user = Arc::new(user.clone());
    let plan = Arc::new(plan);
    let delay = Duration::from_millis(send_delay_ms(inner, &campaign));

    let mut report = DispatchReport::default();
    let mut join_set = JoinSet::new();
    let mut jobs = batch.into_iter().map(|(recipient, attempt)| SendJob {
        campaign: Arc::clone(&campaign),
        user: Arc::clone(&user),
        entry_id: entry.id,
        plan: Arc::clone(&plan),
        recipient,
        attempt,
    });

    let mut spawned = 0usize;

    while join_set.len() < inner.settings.max_concurrent_sends {
        if inner.queue.is_halted(campaign.id) {
            report.halted = true;
            break;
        }
        let Some(job) = jobs.next() else { break };
        pace(delay, &mut spawned).await;
        join_set.spawn(send_one(Arc::clone(inner), job, clock));
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(status) => report.record(status),
            Err(e) => tracing::error!(entry_id = %entry.id, "Send task failed: {e}"),
        }

        if report.stopped() {
            continue;
        }

        if inner.queue.is_halted(campaign.id) {
            report.halted = true;
            continue;
        }

        if let Some(job) = jobs.next() {
            pace(delay, &mut spawned).await;
            join_set.spawn(send_one(Arc::clone(inner), job, clock));
        }
    }

    report
}

/// Wait out the inter-email delay before every dispatch but the first
async fn pace(delay: Duration, spawned: &mut usize) {
    if *spawned > 0 && !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    *spawned += 1;
}

fn variables(job: &SendJob) -> HashMap<String, String> {
    HashMap::from([
        ("email".to_string(), job.recipient.email.clone()),
        ("recipient_id".to_string(), job.recipient.id.to_string()),
        ("campaign_name".to_string(), job.campaign.name.clone()),
    ])
}

async fn send_one(inner: Arc<Inner>, job: SendJob, clock: PassClock) -> SendStatus {
    let campaign_id = job.campaign.id;

    if inner.queue.is_halted(campaign_id) {
        return SendStatus::Halted;
    }

    let reservation = match inner.usage.reserve(&job.user, 1, clock.now()).await {
        Ok(reservation) => reservation,
        Err(e) if e.is_capacity() => {
            internal!(level = DEBUG, campaign_id = %campaign_id, "Not sending: {e}");
            return SendStatus::Capacity;
        }
        Err(e) => {
            tracing::warn!(campaign_id = %campaign_id, "Unable to reserve usage: {e}");
            return SendStatus::Error;
        }
    };

    inner.rate_limiter.acquire(inner.rate_limiter.provider()).await;

    if inner.queue.is_halted(campaign_id) {
        reservation.release();
        return SendStatus::Halted;
    }

    let (variant_id, content) = job.plan.content_for(&job.campaign, &job.recipient);

    let result = match inner.ctx.renderer.render(&content, &variables(&job)).await {
        Ok(rendered) => {
            outgoing!(
                campaign_id = %campaign_id,
                recipient_id = %job.recipient.id,
                attempt = job.attempt,
                "Sending email"
            );
            tokio::time::timeout(
                inner.settings.send_timeout,
                inner.ctx.transport.send_email(&job.recipient, &rendered),
            )
            .await
            .unwrap_or_else(|_| {
                SendResult::failed(
                    TemporaryError::Timeout(inner.settings.send_timeout).to_string(),
                    false,
                )
            })
        }
        Err(e) => {
            let permanent = matches!(e, CollaboratorError::TemplateNotFound(_));
            SendResult::failed(e.to_string(), permanent)
        }
    };

    let at = clock.now();
    let outcome = if result.success {
        SendOutcome::Sent
    } else {
        SendOutcome::Failed {
            error: result
                .error
                .unwrap_or_else(|| "transport reported failure without a reason".to_string()),
            permanent: result.permanent,
        }
    };

    let retry = &inner.settings.retry;
    let next_retry_at = match &outcome {
        SendOutcome::Failed {
            permanent: false, ..
        } if retry.allows_retry(job.attempt) => Some(retry.next_retry_at(job.attempt, at)),
        _ => None,
    };

    let record = SendRecord {
        id: SendId::generate(),
        user_id: job.campaign.user_id,
        campaign_id,
        entry_id: job.entry_id,
        recipient_id: job.recipient.id.clone(),
        variant_id,
        outcome,
        attempt: job.attempt,
        provider_message_id: result.provider_message_id,
        at,
        next_retry_at,
    };

    if let Err(e) = inner.ctx.log.append_send(&record).await {
        tracing::error!(
            campaign_id = %campaign_id,
            recipient_id = %job.recipient.id,
            sent = record.outcome.is_sent(),
            "Unable to record send outcome: {e}"
        );
        return SendStatus::Error;
    }

    match &record.outcome {
        SendOutcome::Sent => {
            reservation.commit();
            outgoing!(
                level = DEBUG,
                campaign_id = %campaign_id,
                recipient_id = %job.recipient.id,
                "Email sent"
            );
            SendStatus::Sent(at)
        }
        SendOutcome::Failed { error, permanent } => {
            reservation.release();
            tracing::warn!(
                campaign_id = %campaign_id,
                recipient_id = %job.recipient.id,
                attempt = job.attempt,
                permanent,
                retry_at = ?record.next_retry_at,
                "Send failed: {error}"
            );
            if record.next_retry_at.is_some() {
                SendStatus::Retrying
            } else {
                SendStatus::FailedPermanently
            }
        }
    }
}
