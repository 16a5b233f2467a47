//! Monitor configuration

use serde::{Deserialize, Serialize};

/// Rates at which a campaign's health degrades
///
/// All rates are fractions of successful sends, so `0.05` is 5%.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Bounce rate above which the campaign is critical
    ///
    /// Default: 0.05
    #[serde(default = "default_critical_bounce_rate")]
    pub critical_bounce_rate: f64,

    /// Complaint rate above which the campaign is critical
    ///
    /// Default: 0.001
    #[serde(default = "default_critical_complaint_rate")]
    pub critical_complaint_rate: f64,

    /// Delivery rate below which the campaign needs attention
    ///
    /// Default: 0.95
    #[serde(default = "default_warning_delivery_rate")]
    pub warning_delivery_rate: f64,

    /// Open rate below which a campaign with enough volume needs attention
    ///
    /// Default: 0.05
    #[serde(default = "default_low_open_rate")]
    pub low_open_rate: f64,

    /// Successful sends before the open rate is judged
    ///
    /// Default: 100
    #[serde(default = "default_open_rate_min_volume")]
    pub open_rate_min_volume: u64,
}

const fn default_critical_bounce_rate() -> f64 {
    0.05
}

const fn default_critical_complaint_rate() -> f64 {
    0.001
}

const fn default_warning_delivery_rate() -> f64 {
    0.95
}

const fn default_low_open_rate() -> f64 {
    0.05
}

const fn default_open_rate_min_volume() -> u64 {
    100
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            critical_bounce_rate: default_critical_bounce_rate(),
            critical_complaint_rate: default_critical_complaint_rate(),
            warning_delivery_rate: default_warning_delivery_rate(),
            low_open_rate: default_low_open_rate(),
            open_rate_min_volume: default_open_rate_min_volume(),
        }
    }
}
