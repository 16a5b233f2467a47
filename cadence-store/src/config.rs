use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Number of pending future occurrences kept materialised for each
    /// recurring campaign
    ///
    /// Default: 3
    #[serde(default = "default_horizon")]
    pub horizon: usize,
}

const fn default_horizon() -> usize {
    3
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            horizon: default_horizon(),
        }
    }
}
