//! Real-time campaign statistics
//!
//! Derived on every read from the send log, the engagement events and the
//! delivery queue's backlog; nothing here is stored.

use std::collections::BTreeMap;

use ahash::AHashSet;
use cadence_common::{
    CampaignId, EngagementEvent, EngagementKind, RecipientId, SendRecord, Timestamp,
    time::{HOUR_MS, MINUTE_MS},
};
use serde::{Deserialize, Serialize};

use crate::{
    config::HealthThresholds,
    health::{Health, classify},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Recipients still waiting for a send
    pub queued: u64,
    pub sent: u64,
    /// Failed send attempts, retried or not
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementWindow {
    pub total: u64,
    pub last_5_minutes: u64,
    pub last_hour: u64,
}

/// Fractions of successful sends, each zero while nothing was sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub open: f64,
    pub click: f64,
    pub bounce: f64,
    pub delivery: f64,
    pub complaint: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SendingRate {
    /// Sends per minute over the last hour
    pub current: f64,
    /// When the backlog drains at the current rate
    pub estimated_completion: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealTimeStats {
    pub campaign_id: CampaignId,
    pub queue: QueueStats,
    pub engagement: BTreeMap<EngagementKind, EngagementWindow>,
    pub rates: Rates,
    pub health: Health,
    pub sending_rate: SendingRate,
}

#[allow(clippy::cast_precision_loss, reason = "event counts stay far below 2^52")]
fn fraction(count: usize, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        (count as f64 / sent as f64).min(1.0)
    }
}

/// Compute the statistics of one campaign as of `now`.
///
/// Rates count each recipient once per event kind. The delivery rate uses
/// the provider's delivery events; providers that report none are assumed
/// to have delivered everything that did not bounce.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "counts and durations stay far below 2^52"
)]
pub fn compute(
    campaign_id: CampaignId,
    sends: &[SendRecord],
    events: &[EngagementEvent],
    queued: u64,
    thresholds: &HealthThresholds,
    now: Timestamp,
) -> RealTimeStats {
    let sent = sends.iter().filter(|record| record.outcome.is_sent()).count() as u64;
    let failed = sends.len() as u64 - sent;

    let mut engagement: BTreeMap<EngagementKind, EngagementWindow> = EngagementKind::ALL
        .iter()
        .map(|kind| (*kind, EngagementWindow::default()))
        .collect();
    let mut distinct: BTreeMap<EngagementKind, AHashSet<&RecipientId>> = BTreeMap::new();

    for event in events {
        let window = engagement.entry(event.kind).or_default();
        window.total += 1;
        if event.at + 5 * MINUTE_MS > now {
            window.last_5_minutes += 1;
        }
        if event.at + HOUR_MS > now {
            window.last_hour += 1;
        }
        distinct
            .entry(event.kind)
            .or_default()
            .insert(&event.recipient_id);
    }

    let reached = |kind| distinct.get(&kind).map_or(0, |set| set.len());
    let bounce = fraction(reached(EngagementKind::Bounced), sent);
    let delivery = if reached(EngagementKind::Delivered) > 0 {
        fraction(reached(EngagementKind::Delivered), sent)
    } else if sent > 0 {
        1.0 - bounce
    } else {
        0.0
    };

    let rates = Rates {
        open: fraction(reached(EngagementKind::Opened), sent),
        click: fraction(reached(EngagementKind::Clicked), sent),
        bounce,
        delivery,
        complaint: fraction(reached(EngagementKind::Complained), sent),
    };

    let sent_last_hour = sends
        .iter()
        .filter(|record| record.outcome.is_sent() && record.at + HOUR_MS > now)
        .count();
    let current = sent_last_hour as f64 / 60.0;
    let estimated_completion = (queued > 0 && current > 0.0)
        .then(|| now + (queued as f64 / current * MINUTE_MS as f64) as u64);

    RealTimeStats {
        campaign_id,
        queue: QueueStats {
            queued,
            sent,
            failed,
        },
        engagement,
        health: classify(&rates, sent, thresholds),
        rates,
        sending_rate: SendingRate {
            current,
            estimated_completion,
        },
    }
}
