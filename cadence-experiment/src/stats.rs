//! Variant aggregates and the significance test
//!
//! Everything here is recomputed from the send log and engagement events on
//! each analysis. Rates are zero when nothing was sent; lift is `None` when
//! the control rate is zero, which is distinct from a lift of zero.

use std::f64::consts::SQRT_2;

use ahash::{AHashMap, AHashSet};
use cadence_common::{
    AbTest, EngagementEvent, EngagementKind, RecipientId, SendRecord, SuccessMetric, VariantId,
};
use serde::{Deserialize, Serialize};

/// Distinct recipients per variant for each stage of the funnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub conversions: u64,
}

impl VariantMetrics {
    /// Numerator for a success metric
    #[must_use]
    pub const fn successes(&self, metric: SuccessMetric) -> u64 {
        match metric {
            SuccessMetric::OpenRate => self.opened,
            SuccessMetric::ClickRate => self.clicked,
            SuccessMetric::ConversionRate => self.conversions,
        }
    }

    #[must_use]
    pub fn rates(&self) -> VariantRates {
        VariantRates {
            open_rate: rate(self.opened, self.sent),
            click_rate: rate(self.clicked, self.sent),
            conversion_rate: rate(self.conversions, self.sent),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantRates {
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
}

impl VariantRates {
    #[must_use]
    pub const fn get(&self, metric: SuccessMetric) -> f64 {
        match metric {
            SuccessMetric::OpenRate => self.open_rate,
            SuccessMetric::ClickRate => self.click_rate,
            SuccessMetric::ConversionRate => self.conversion_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticalAnalysis {
    pub sample_size: u64,
    /// `None` for the control, which is not tested against itself
    pub p_value: Option<f64>,
    /// Relative improvement over the control in percent
    pub lift: Option<f64>,
    pub statistical_significance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: VariantId,
    pub name: String,
    pub is_control: bool,
    pub metrics: VariantMetrics,
    pub rates: VariantRates,
    pub analysis: StatisticalAnalysis,
}

/// `count / sent`, zero when nothing was sent
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "send counts stay far below 2^52")]
pub fn rate(count: u64, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        count as f64 / sent as f64
    }
}

/// `(variant - control) / control * 100`, undefined for a zero control rate
#[must_use]
pub fn lift(variant_rate: f64, control_rate: f64) -> Option<f64> {
    (control_rate > 0.0).then(|| (variant_rate - control_rate) / control_rate * 100.0)
}

/// One-sided pooled two-proportion z-test of "variant beats control".
///
/// Returns `(z, p)`. With no data, or when every sample succeeded or every
/// sample failed, the proportions cannot be told apart and `p` is 1.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "send counts stay far below 2^52")]
pub fn z_test(control: (u64, u64), variant: (u64, u64)) -> (f64, f64) {
    let (control_successes, control_n) = control;
    let (variant_successes, variant_n) = variant;
    if control_n == 0 || variant_n == 0 {
        return (0.0, 1.0);
    }

    let pooled = (control_successes + variant_successes) as f64 / (control_n + variant_n) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / control_n as f64 + 1.0 / variant_n as f64)).sqrt();
    if se <= f64::EPSILON {
        return (0.0, 1.0);
    }

    let z = (rate(variant_successes, variant_n) - rate(control_successes, control_n)) / se;
    (z, 1.0 - normal_cdf(z))
}

#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / P.mul_add(x, 1.0);
    let poly = t * A5.mul_add(t, A4).mul_add(t, A3).mul_add(t, A2).mul_add(t, A1);
    sign * poly.mul_add(-(-x * x).exp(), 1.0)
}

/// Per-variant funnel counts for a test
///
/// A recipient counts towards a variant once a send carrying that variant
/// succeeded; engagement events are attributed through those sends, so
/// winner rollout traffic never pollutes the test's numbers.
#[must_use]
pub fn variant_metrics(
    test: &AbTest,
    sends: &[SendRecord],
    events: &[EngagementEvent],
) -> AHashMap<VariantId, VariantMetrics> {
    let variants: AHashSet<VariantId> = test.variants.iter().map(|v| v.id).collect();

    let mut reached: AHashMap<&RecipientId, VariantId> = AHashMap::new();
    for record in sends {
        if let Some(variant) = record.variant_id
            && record.outcome.is_sent()
            && variants.contains(&variant)
        {
            reached.entry(&record.recipient_id).or_insert(variant);
        }
    }

    let mut metrics: AHashMap<VariantId, VariantMetrics> =
        variants.iter().map(|id| (*id, VariantMetrics::default())).collect();
    for variant in reached.values() {
        if let Some(m) = metrics.get_mut(variant) {
            m.sent += 1;
        }
    }

    let mut seen: AHashSet<(&RecipientId, EngagementKind)> = AHashSet::new();
    for event in events {
        let Some(variant) = reached.get(&event.recipient_id) else {
            continue;
        };
        if !seen.insert((&event.recipient_id, event.kind)) {
            continue;
        }
        let Some(m) = metrics.get_mut(variant) else {
            continue;
        };
        match event.kind {
            EngagementKind::Delivered => m.delivered += 1,
            EngagementKind::Opened => m.opened += 1,
            EngagementKind::Clicked => m.clicked += 1,
            EngagementKind::Converted => m.conversions += 1,
            EngagementKind::Bounced
            | EngagementKind::Complained
            | EngagementKind::Unsubscribed => {}
        }
    }

    metrics
}

/// Results for every variant of `test`, control first
#[must_use]
pub fn variant_results(
    test: &AbTest,
    metrics: &AHashMap<VariantId, VariantMetrics>,
) -> Vec<VariantResult> {
    let settings = &test.configuration.statistical_settings;
    let primary = test.configuration.success_metrics.primary;
    let threshold = 1.0 - settings.confidence_level;

    let metrics_of = |id: VariantId| metrics.get(&id).copied().unwrap_or_default();
    let control = test.control().map(|variant| metrics_of(variant.id));

    let mut results: Vec<VariantResult> = test
        .variants
        .iter()
        .map(|variant| {
            let own = metrics_of(variant.id);
            let rates = own.rates();

            let analysis = match control {
                Some(control) if !variant.is_control => {
                    let (_, p_value) = z_test(
                        (control.successes(primary), control.sent),
                        (own.successes(primary), own.sent),
                    );
                    StatisticalAnalysis {
                        sample_size: own.sent,
                        p_value: Some(p_value),
                        lift: lift(rates.get(primary), control.rates().get(primary)),
                        statistical_significance: own.sent >= settings.minimum_sample_size
                            && p_value < threshold,
                    }
                }
                _ => StatisticalAnalysis {
                    sample_size: own.sent,
                    p_value: None,
                    lift: None,
                    statistical_significance: false,
                },
            };

            VariantResult {
                variant_id: variant.id,
                name: variant.name.clone(),
                is_control: variant.is_control,
                metrics: own,
                rates,
                analysis,
            }
        })
        .collect();

    results.sort_by_key(|result| !result.is_control);
    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use cadence_common::{
        CampaignId, ContentRef, EntryId, SendId, SendOutcome, TestConfiguration, UserId, Variant,
    };

    use super::*;

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() < tolerance
    }

    #[test]
    fn rates_are_zero_without_sends() {
        assert!(rate(0, 0).abs() < f64::EPSILON);
        assert!(rate(5, 0).abs() < f64::EPSILON);
        assert!(rate(5, 0).is_finite());

        let rates = VariantMetrics::default().rates();
        assert!(rates.open_rate.abs() < f64::EPSILON);
        assert!(rates.click_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn lift_is_undefined_for_a_zero_control_rate() {
        assert_eq!(lift(0.1, 0.0), None);
        assert_eq!(lift(0.1, 0.1), Some(0.0));
        assert!(close(lift(0.14, 0.10).unwrap(), 40.0, 1e-9));
    }

    #[test]
    fn normal_cdf_matches_known_values() {
        assert!(close(normal_cdf(0.0), 0.5, 1e-7));
        assert!(close(normal_cdf(1.96), 0.975, 1e-4));
        assert!(close(normal_cdf(-1.645), 0.05, 1e-4));
    }

    #[test]
    fn ten_versus_fourteen_percent_is_significant() {
        let (z, p) = z_test((50, 500), (70, 500));
        assert!(close(z, 1.946, 1e-3), "z = {z}");
        assert!(close(p, 0.0258, 1e-3), "p = {p}");
        assert!(p < 0.05);
    }

    #[test]
    fn worse_variants_are_never_significant() {
        let (z, p) = z_test((70, 500), (50, 500));
        assert!(z < 0.0);
        assert!(p > 0.5);
    }

    #[test]
    fn degenerate_samples_are_not_significant() {
        assert_eq!(z_test((0, 0), (10, 100)), (0.0, 1.0));
        assert_eq!(z_test((0, 100), (0, 100)), (0.0, 1.0));
        assert_eq!(z_test((100, 100), (100, 100)), (0.0, 1.0));
    }

    fn send(campaign: CampaignId, recipient: &str, variant: VariantId) -> SendRecord {
        SendRecord {
            id: SendId::generate(),
            user_id: UserId::generate(),
            campaign_id: campaign,
            entry_id: EntryId::generate(),
            recipient_id: RecipientId::new(recipient),
            variant_id: Some(variant),
            outcome: SendOutcome::Sent,
            attempt: 1,
            provider_message_id: None,
            at: 0,
            next_retry_at: None,
        }
    }

    #[test]
    fn metrics_count_distinct_recipients_reached_by_each_variant() {
        let content = ContentRef::Template {
            template_id: "t".to_string(),
        };
        let control = Variant::new("control", true, content.clone());
        let challenger = Variant::new("challenger", false, content);
        let campaign = CampaignId::generate();
        let test = AbTest::new(
            campaign,
            "subject",
            vec![control.clone(), challenger.clone()],
            TestConfiguration::default(),
            0,
        );

        let sends = vec![
            send(campaign, "a", control.id),
            send(campaign, "b", challenger.id),
            send(campaign, "c", challenger.id),
        ];
        let open = |recipient: &str| {
            EngagementEvent::new(campaign, RecipientId::new(recipient), EngagementKind::Opened, 1)
        };
        // duplicate open and an open from someone outside the test
        let events = vec![open("b"), open("b"), open("z")];

        let metrics = variant_metrics(&test, &sends, &events);
        assert_eq!(metrics[&control.id].sent, 1);
        assert_eq!(metrics[&control.id].opened, 0);
        assert_eq!(metrics[&challenger.id].sent, 2);
        assert_eq!(metrics[&challenger.id].opened, 1);

        let results = variant_results(&test, &metrics);
        assert!(results[0].is_control);
        assert!(close(results[1].rates.open_rate, 0.5, 1e-9));
        assert_eq!(results[1].analysis.lift, None);
        assert!(!results[1].analysis.statistical_significance);
    }
}
