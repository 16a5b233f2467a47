//! A/B test definitions

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    campaign::ContentRef,
    ids::{CampaignId, RecipientId, TestId, VariantId},
    send::EngagementKind,
    time::Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        })
    }
}

/// The rate a test is judged on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessMetric {
    OpenRate,
    ClickRate,
    ConversionRate,
}

impl SuccessMetric {
    /// The engagement event counted in the numerator
    #[must_use]
    pub const fn engagement(self) -> EngagementKind {
        match self {
            Self::OpenRate => EngagementKind::Opened,
            Self::ClickRate => EngagementKind::Clicked,
            Self::ConversionRate => EngagementKind::Converted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMetrics {
    pub primary: SuccessMetric,
    #[serde(default)]
    pub secondary: Vec<SuccessMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticalSettings {
    /// e.g. `0.95`; a variant is significant when `p < 1 - confidence_level`
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_minimum_sample_size")]
    pub minimum_sample_size: u64,
    #[serde(default)]
    pub automatic_winner: bool,
}

const fn default_confidence_level() -> f64 {
    0.95
}

const fn default_minimum_sample_size() -> u64 {
    100
}

impl Default for StatisticalSettings {
    fn default() -> Self {
        Self {
            confidence_level: default_confidence_level(),
            minimum_sample_size: default_minimum_sample_size(),
            automatic_winner: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub success_metrics: SuccessMetrics,
    #[serde(default)]
    pub statistical_settings: StatisticalSettings,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            success_metrics: SuccessMetrics {
                primary: SuccessMetric::OpenRate,
                secondary: vec![SuccessMetric::ClickRate],
            },
            statistical_settings: StatisticalSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub name: String,
    pub is_control: bool,
    pub content: ContentRef,
    /// Relative share of newly assigned recipients
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Stable once the test has started
    pub assigned_recipients: BTreeSet<RecipientId>,
}

const fn default_weight() -> u32 {
    1
}

impl Variant {
    #[must_use]
    pub fn new(name: impl Into<String>, is_control: bool, content: ContentRef) -> Self {
        Self {
            id: VariantId::generate(),
            name: name.into(),
            is_control,
            content,
            weight: default_weight(),
            assigned_recipients: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTest {
    pub id: TestId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub variants: Vec<Variant>,
    pub status: TestStatus,
    /// Set at most once, then immutable
    pub winning_variant_id: Option<VariantId>,
    pub configuration: TestConfiguration,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Bumped on every write, used for compare-and-swap
    pub version: u64,
}

impl AbTest {
    #[must_use]
    pub fn new(
        campaign_id: CampaignId,
        name: impl Into<String>,
        variants: Vec<Variant>,
        configuration: TestConfiguration,
        now: Timestamp,
    ) -> Self {
        Self {
            id: TestId::generate(),
            campaign_id,
            name: name.into(),
            variants,
            status: TestStatus::Draft,
            winning_variant_id: None,
            configuration,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    #[must_use]
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    #[must_use]
    pub fn variant(&self, id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// The variant a recipient was assigned to, if any
    #[must_use]
    pub fn variant_of(&self, recipient: &RecipientId) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.assigned_recipients.contains(recipient))
    }
}
