//! Send-time optimisation
//!
//! Recipients are grouped by IANA timezone and, for each group, the 24
//! local hours are ranked by recency-weighted open and click history. The
//! result is advisory: the processor only uses it to order recipients
//! within a batch, and rate limits always take precedence.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use cadence_common::{
    EngagementEvent, EngagementKind, Recipient, RecipientId, Timestamp, UserId,
    time::{DAY_MS, local_hour, parse_timezone},
};
use cadence_store::EventLog;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

const FALLBACK_TIMEZONE: &str = "UTC";

/// Relative engagement by local hour when there is no history. Peaks
/// mid-morning and mid-afternoon.
const DEFAULT_CURVE: [f64; 24] = [
    0.05, 0.03, 0.02, 0.02, 0.03, 0.08, 0.20, 0.40, 0.65, 0.85, 1.00, 0.90, //
    0.70, 0.80, 0.95, 0.85, 0.65, 0.50, 0.40, 0.35, 0.30, 0.20, 0.12, 0.08,
];

const fn default_lookback_days() -> u64 {
    30
}

const fn default_top_hours() -> usize {
    3
}

const fn default_half_life_days() -> f64 {
    7.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// How much engagement history to consider
    ///
    /// Default: 30 days
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u64,

    /// Number of hours returned per timezone
    ///
    /// Default: 3
    #[serde(default = "default_top_hours")]
    pub top_hours: usize,

    /// Age at which an event counts half as much as a fresh one
    ///
    /// Default: 7 days
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            top_hours: default_top_hours(),
            half_life_days: default_half_life_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimezoneSendWindow {
    pub timezone: String,
    pub recipient_count: usize,
    /// Local hours, best first
    pub optimal_hours: Vec<u32>,
    /// Mean weighted engagement per recipient in the bucket
    pub avg_engagement: f64,
    /// Whether the ranking came from history rather than the default curve
    pub from_history: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SendTimeOptimizer {
    config: OptimizerConfig,
}

fn timezone_of(recipient: &Recipient) -> (String, Tz) {
    match parse_timezone(recipient.timezone.as_deref()) {
        Ok(tz) if recipient.timezone.is_some() => (tz.name().to_string(), tz),
        _ => (FALLBACK_TIMEZONE.to_string(), Tz::UTC),
    }
}

fn rank(scores: &[f64; 24], top: usize) -> Vec<u32> {
    let mut hours: Vec<u32> = (0..24).collect();
    hours.sort_by(|a, b| {
        scores[*b as usize]
            .total_cmp(&scores[*a as usize])
            .then(a.cmp(b))
    });
    hours.truncate(top);
    hours
}

impl SendTimeOptimizer {
    #[must_use]
    pub const fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    fn weight(&self, event: &EngagementEvent, now: Timestamp) -> f64 {
        let kind = match event.kind {
            EngagementKind::Opened => 1.0,
            EngagementKind::Clicked => 2.0,
            _ => return 0.0,
        };

        #[allow(clippy::cast_precision_loss)]
        let age_days = now.saturating_sub(event.at) as f64 / DAY_MS as f64;
        kind * 0.5f64.powf(age_days / self.config.half_life_days.max(f64::EPSILON))
    }

    /// Rank send hours for every timezone present in `recipients`
    #[must_use]
    pub fn calculate(
        &self,
        recipients: &[Recipient],
        history: &[EngagementEvent],
        now: Timestamp,
    ) -> Vec<TimezoneSendWindow> {
        let since = now.saturating_sub(self.config.lookback_days.saturating_mul(DAY_MS));

        let mut buckets: BTreeMap<String, (Tz, AHashSet<&RecipientId>)> = BTreeMap::new();
        for recipient in recipients {
            let (name, tz) = timezone_of(recipient);
            buckets
                .entry(name)
                .or_insert_with(|| (tz, AHashSet::new()))
                .1
                .insert(&recipient.id);
        }

        let mut events: AHashMap<&RecipientId, Vec<&EngagementEvent>> = AHashMap::new();
        for event in history
            .iter()
            .filter(|event| event.kind.is_engagement() && event.at >= since && event.at <= now)
        {
            events.entry(&event.recipient_id).or_default().push(event);
        }

        buckets
            .into_iter()
            .map(|(timezone, (tz, members))| {
                let mut scores = [0.0f64; 24];
                let mut total = 0.0;

                for event in members.iter().filter_map(|id| events.get(id)).flatten() {
                    let weight = self.weight(event, now);
                    scores[local_hour(event.at, tz) as usize] += weight;
                    total += weight;
                }

                let from_history = total > 0.0;
                let optimal_hours = if from_history {
                    rank(&scores, self.config.top_hours)
                } else {
                    rank(&DEFAULT_CURVE, self.config.top_hours)
                };

                #[allow(clippy::cast_precision_loss)]
                let avg_engagement = total / members.len().max(1) as f64;

                TimezoneSendWindow {
                    timezone,
                    recipient_count: members.len(),
                    optimal_hours,
                    avg_engagement,
                    from_history,
                }
            })
            .collect()
    }

    /// [`Self::calculate`] over the user's engagement history
    pub async fn for_user(
        &self,
        log: &dyn EventLog,
        user: UserId,
        recipients: &[Recipient],
        now: Timestamp,
    ) -> Result<Vec<TimezoneSendWindow>, DeliveryError> {
        let since = now.saturating_sub(self.config.lookback_days.saturating_mul(DAY_MS));
        let history = log.user_engagements(user, since).await?;
        Ok(self.calculate(recipients, &history, now))
    }

    /// Order a batch so recipients currently inside one of their timezone's
    /// optimal hours come first. Otherwise the order is kept.
    pub fn order<T, F>(
        &self,
        items: &mut [T],
        recipient: F,
        windows: &[TimezoneSendWindow],
        now: Timestamp,
    ) where
        F: Fn(&T) -> &Recipient,
    {
        let preferred: AHashMap<&str, &[u32]> = windows
            .iter()
            .map(|window| (window.timezone.as_str(), window.optimal_hours.as_slice()))
            .collect();

        items.sort_by_cached_key(|item| {
            let (name, tz) = timezone_of(recipient(item));
            let hour = local_hour(now, tz);
            preferred
                .get(name.as_str())
                .and_then(|hours| hours.iter().position(|h| *h == hour))
                .unwrap_or(usize::MAX)
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use cadence_common::{CampaignId, time::HOUR_MS};
    use pretty_assertions::assert_eq;

    use super::*;

    // 2026-03-10 00:00 UTC
    const NOW: Timestamp = 1_773_100_800_000;

    fn opened(recipient: &str, at: Timestamp) -> EngagementEvent {
        EngagementEvent::new(
            CampaignId::generate(),
            RecipientId::new(recipient),
            EngagementKind::Opened,
            at,
        )
    }

    #[test]
    fn without_history_the_default_curve_is_used() {
        let optimizer = SendTimeOptimizer::default();
        let recipients = vec![Recipient::new("a", "a@example.com")];

        let windows = optimizer.calculate(&recipients, &[], NOW);

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].timezone, "UTC");
        assert!(!windows[0].from_history);
        assert_eq!(windows[0].optimal_hours, vec![10, 14, 11]);
    }

    #[test]
    fn history_is_ranked_in_local_time() {
        let optimizer = SendTimeOptimizer::default();
        let recipients = vec![
            Recipient::new("a", "a@example.com").with_timezone("Asia/Tokyo"),
            Recipient::new("b", "b@example.com").with_timezone("Asia/Tokyo"),
            Recipient::new("c", "c@example.com"),
        ];
        // 2026-03-09 11:00 UTC is 20:00 in Tokyo
        let evening = NOW - 13 * HOUR_MS;
        let history = vec![opened("a", evening), opened("b", evening), opened("c", evening)];

        let windows = optimizer.calculate(&recipients, &history, NOW);

        let tokyo = windows.iter().find(|w| w.timezone == "Asia/Tokyo").unwrap();
        assert!(tokyo.from_history);
        assert_eq!(tokyo.recipient_count, 2);
        assert_eq!(tokyo.optimal_hours[0], 20);

        let utc = windows.iter().find(|w| w.timezone == "UTC").unwrap();
        assert_eq!(utc.optimal_hours[0], 11);
    }

    #[test]
    fn old_events_fall_outside_the_lookback() {
        let optimizer = SendTimeOptimizer::default();
        let recipients = vec![Recipient::new("a", "a@example.com")];
        let history = vec![opened("a", NOW - 40 * DAY_MS)];

        let windows = optimizer.calculate(&recipients, &history, NOW);

        assert!(!windows[0].from_history);
    }

    #[test]
    fn recent_engagement_outweighs_old() {
        let optimizer = SendTimeOptimizer::default();
        let recipients = vec![Recipient::new("a", "a@example.com")];
        let history = vec![
            opened("a", NOW - 20 * DAY_MS + 3 * HOUR_MS),
            opened("a", NOW - 20 * DAY_MS + 3 * HOUR_MS),
            opened("a", NOW - DAY_MS + 16 * HOUR_MS),
        ];

        let windows = optimizer.calculate(&recipients, &history, NOW);

        assert_eq!(windows[0].optimal_hours[0], 16);
    }

    #[test]
    fn recipients_in_their_optimal_hour_are_ordered_first() {
        let optimizer = SendTimeOptimizer::default();
        let mut batch = vec![
            Recipient::new("utc", "u@example.com"),
            Recipient::new("tokyo", "t@example.com").with_timezone("Asia/Tokyo"),
        ];
        let windows = vec![
            TimezoneSendWindow {
                timezone: "UTC".to_string(),
                recipient_count: 1,
                optimal_hours: vec![10],
                avg_engagement: 0.0,
                from_history: false,
            },
            TimezoneSendWindow {
                timezone: "Asia/Tokyo".to_string(),
                recipient_count: 1,
                optimal_hours: vec![9],
                avg_engagement: 0.0,
                from_history: false,
            },
        ];

        // 00:00 UTC is 09:00 in Tokyo
        optimizer.order(&mut batch, |r| r, &windows, NOW);

        assert_eq!(batch[0].id.as_str(), "tokyo");
    }
}
