//! Recipient to variant assignment
//!
//! Assignments only ever grow: a recipient placed in a variant stays there.
//! Recipients that join the audience later are shuffled and spread over the
//! variants in proportion to their weights.

use ahash::AHashMap;
use cadence_common::{RecipientId, Variant};
use rand::{Rng, seq::SliceRandom};

use crate::error::ExperimentError;

/// Assign every unassigned member of `audience` to one of `variants`,
/// returning how many recipients were newly assigned.
///
/// # Errors
///
/// Returns [`ExperimentError::Config`] when there are no variants, the
/// weights do not line up with the variants, or every weight is zero.
pub fn assign_recipients(
    audience: &[RecipientId],
    variants: &mut [Variant],
    weights: &[u32],
) -> Result<usize, ExperimentError> {
    assign_recipients_with(audience, variants, weights, &mut rand::rng())
}

/// [`assign_recipients`] with a caller supplied source of randomness
pub fn assign_recipients_with<R: Rng + ?Sized>(
    audience: &[RecipientId],
    variants: &mut [Variant],
    weights: &[u32],
    rng: &mut R,
) -> Result<usize, ExperimentError> {
    if variants.is_empty() {
        return Err(ExperimentError::Config("a test needs at least one variant".to_string()));
    }
    if weights.len() != variants.len() {
        return Err(ExperimentError::Config(format!(
            "{} weights given for {} variants",
            weights.len(),
            variants.len()
        )));
    }
    if weights.iter().all(|&weight| weight == 0) {
        return Err(ExperimentError::Config("variant weights sum to zero".to_string()));
    }

    let mut fresh: Vec<&RecipientId> = audience
        .iter()
        .filter(|recipient| {
            !variants
                .iter()
                .any(|variant| variant.assigned_recipients.contains(*recipient))
        })
        .collect();
    fresh.sort_unstable();
    fresh.dedup();
    fresh.shuffle(rng);

    let counts = allocate(fresh.len(), weights);
    let mut remaining = fresh.into_iter();
    for (variant, count) in variants.iter_mut().zip(counts.iter()) {
        variant
            .assigned_recipients
            .extend(remaining.by_ref().take(*count).cloned());
    }

    Ok(counts.iter().sum())
}

/// Split `total` by `weights` using largest remainders, so the counts always
/// add up to `total`
#[allow(
    clippy::cast_possible_truncation,
    reason = "each share is at most total, which came from a usize"
)]
fn allocate(total: usize, weights: &[u32]) -> Vec<usize> {
    let sum: u64 = weights.iter().copied().map(u64::from).sum();
    let total = total as u64;

    let mut counts: Vec<usize> = weights
        .iter()
        .map(|&weight| (total * u64::from(weight) / sum) as usize)
        .collect();

    let mut remainders: Vec<(u64, usize)> = weights
        .iter()
        .enumerate()
        .map(|(index, &weight)| ((total * u64::from(weight)) % sum, index))
        .collect();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let short = total as usize - counts.iter().sum::<usize>();
    for (_, index) in remainders.into_iter().take(short) {
        counts[index] += 1;
    }

    counts
}

/// Check that the variants partition `audience`: exactly one control, no
/// recipient in two variants and every audience member assigned.
///
/// Assigned recipients who have since left the audience are allowed; the
/// delivery processor only sends to the audience as currently resolved.
pub fn validate_partition(
    variants: &[Variant],
    audience: &[RecipientId],
) -> Result<(), ExperimentError> {
    let controls = variants.iter().filter(|variant| variant.is_control).count();
    if controls != 1 {
        return Err(ExperimentError::Config(format!(
            "exactly one control variant is required, found {controls}"
        )));
    }

    let mut owner: AHashMap<&RecipientId, &str> = AHashMap::new();
    for variant in variants {
        for recipient in &variant.assigned_recipients {
            if let Some(other) = owner.insert(recipient, &variant.name) {
                return Err(ExperimentError::InvalidPartition(format!(
                    "recipient {recipient} is assigned to both {other} and {}",
                    variant.name
                )));
            }
        }
    }

    let unassigned = audience
        .iter()
        .filter(|recipient| !owner.contains_key(recipient))
        .count();
    if unassigned > 0 {
        return Err(ExperimentError::InvalidPartition(format!(
            "{unassigned} recipients of the audience are unassigned"
        )));
    }

    Ok(())
}
