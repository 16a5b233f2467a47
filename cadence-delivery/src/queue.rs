//! In-process bookkeeping for the delivery processor
//!
//! The schedule store is the source of truth for entries. The queue only
//! tracks what this process is doing right now: which entries a pass has
//! claimed, which campaigns must not dispatch more work, and how many
//! recipients each partially drained entry still owes.

use std::sync::Arc;

use cadence_common::{CampaignId, EntryId};
use dashmap::{DashMap, mapref::entry::Entry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Resumable,
    /// Dropped once the campaign's last claim is released
    Final,
}

/// Exclusive right to work an entry, released on drop
#[derive(Debug)]
pub struct Claim {
    claims: Arc<DashMap<EntryId, CampaignId>>,
    halted: Arc<DashMap<CampaignId, Halt>>,
    entry_id: EntryId,
    campaign_id: CampaignId,
}

impl Claim {
    #[must_use]
    pub const fn entry_id(&self) -> EntryId {
        self.entry_id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.remove(&self.entry_id);
        release_final(&self.claims, &self.halted, self.campaign_id);
    }
}

fn release_final(
    claims: &DashMap<EntryId, CampaignId>,
    halted: &DashMap<CampaignId, Halt>,
    campaign_id: CampaignId,
) {
    if !claims.iter().any(|claim| *claim.value() == campaign_id) {
        halted.remove_if(&campaign_id, |_, halt| *halt == Halt::Final);
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryQueue {
    claims: Arc<DashMap<EntryId, CampaignId>>,
    halted: Arc<DashMap<CampaignId, Halt>>,
    /// Recipients still owed by partially drained entries
    backlog: Arc<DashMap<EntryId, (CampaignId, u64)>>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an entry unless another pass is already working it
    pub fn try_claim(&self, entry_id: EntryId, campaign_id: CampaignId) -> Option<Claim> {
        match self.claims.entry(entry_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(campaign_id);
                Some(Claim {
                    claims: Arc::clone(&self.claims),
                    halted: Arc::clone(&self.halted),
                    entry_id,
                    campaign_id,
                })
            }
        }
    }

    pub fn is_claimed(&self, entry_id: EntryId) -> bool {
        self.claims.contains_key(&entry_id)
    }

    /// Entries of the campaign currently being worked
    pub fn claims_for(&self, campaign_id: CampaignId) -> Vec<EntryId> {
        self.claims
            .iter()
            .filter(|claim| *claim.value() == campaign_id)
            .map(|claim| *claim.key())
            .collect()
    }

    /// Every entry currently being worked
    pub fn in_flight(&self) -> Vec<EntryId> {
        self.claims.iter().map(|claim| *claim.key()).collect()
    }

    /// Stop dispatching undispatched work for the campaign
    pub fn halt(&self, campaign_id: CampaignId) {
        self.halted.entry(campaign_id).or_insert(Halt::Resumable);
    }

    /// Halt a campaign that will never dispatch again. The mark only lives
    /// while entries of the campaign are still being worked.
    pub fn retire(&self, campaign_id: CampaignId) {
        self.halted.insert(campaign_id, Halt::Final);
        release_final(&self.claims, &self.halted, campaign_id);
    }

    pub fn resume(&self, campaign_id: CampaignId) {
        self.halted.remove(&campaign_id);
    }

    pub fn is_halted(&self, campaign_id: CampaignId) -> bool {
        self.halted.contains_key(&campaign_id)
    }

    pub fn set_backlog(&self, entry_id: EntryId, campaign_id: CampaignId, outstanding: u64) {
        if outstanding == 0 {
            self.backlog.remove(&entry_id);
        } else {
            self.backlog.insert(entry_id, (campaign_id, outstanding));
        }
    }

    pub fn clear_backlog(&self, entry_id: EntryId) {
        self.backlog.remove(&entry_id);
    }

    /// Recipients of the campaign still waiting for a send
    pub fn queued_for(&self, campaign_id: CampaignId) -> u64 {
        self.backlog
            .iter()
            .filter(|entry| entry.value().0 == campaign_id)
            .map(|entry| entry.value().1)
            .sum()
    }
}
