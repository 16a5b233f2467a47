//! Per-recipient job state, derived from the send log
//!
//! A recipient's state within an entry is a function of its send records:
//! there is no separate job table to keep consistent with the log.

use ahash::AHashMap;
use cadence_common::{Recipient, RecipientId, SendRecord, Timestamp};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Sent,
    FailedPermanently,
    WaitingForRetry { until: Timestamp },
    /// Ready for its `attempt`th send
    Queued { attempt: u32 },
}

impl RecipientState {
    /// State of a recipient given its records for the entry
    #[must_use]
    pub fn derive(records: &[&SendRecord], policy: &RetryPolicy, now: Timestamp) -> Self {
        if records.iter().any(|record| record.outcome.is_sent()) {
            return Self::Sent;
        }

        let Some(latest) = records.iter().max_by_key(|record| (record.attempt, record.at)) else {
            return Self::Queued { attempt: 1 };
        };

        match &latest.outcome {
            cadence_common::SendOutcome::Failed { permanent: true, .. } => Self::FailedPermanently,
            _ if !policy.allows_retry(latest.attempt) => Self::FailedPermanently,
            _ => match latest.next_retry_at {
                Some(until) if until > now => Self::WaitingForRetry { until },
                _ => Self::Queued {
                    attempt: latest.attempt + 1,
                },
            },
        }
    }
}

/// Progress of an entry's audience
#[derive(Debug, Clone, Default)]
pub struct EntryProgress {
    pub sent: u64,
    pub failed: u64,
    pub waiting: u64,
    /// Recipients ready to be sent to, with the attempt number they are on
    pub eligible: Vec<(Recipient, u32)>,
    /// Time of the most recent successful send
    pub last_sent_at: Option<Timestamp>,
    /// Earliest time a waiting recipient becomes eligible again
    pub next_retry_at: Option<Timestamp>,
}

impl EntryProgress {
    #[must_use]
    pub fn derive(
        recipients: Vec<Recipient>,
        records: &[SendRecord],
        policy: &RetryPolicy,
        now: Timestamp,
    ) -> Self {
        let mut by_recipient: AHashMap<&RecipientId, Vec<&SendRecord>> = AHashMap::new();
        for record in records {
            by_recipient.entry(&record.recipient_id).or_default().push(record);
        }

        let mut progress = Self {
            last_sent_at: records
                .iter()
                .filter(|record| record.outcome.is_sent())
                .map(|record| record.at)
                .max(),
            ..Self::default()
        };

        for recipient in recipients {
            let state = by_recipient
                .get(&recipient.id)
                .map_or(RecipientState::Queued { attempt: 1 }, |records| {
                    RecipientState::derive(records, policy, now)
                });

            match state {
                RecipientState::Sent => progress.sent += 1,
                RecipientState::FailedPermanently => progress.failed += 1,
                RecipientState::WaitingForRetry { until } => {
                    progress.waiting += 1;
                    progress.next_retry_at =
                        Some(progress.next_retry_at.map_or(until, |at| at.min(until)));
                }
                RecipientState::Queued { attempt } => progress.eligible.push((recipient, attempt)),
            }
        }

        progress
    }

    /// Recipients that still need a send
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.waiting + self.eligible.len() as u64
    }
}
