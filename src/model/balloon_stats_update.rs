use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Update the statistics polling interval, for `PATCH /balloon/statistics`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BalloonStatsUpdate {
    /// Interval in seconds between refreshing statistics.
    /// Required: true
    #[serde(rename = "stats_polling_interval_s")]
    pub stats_polling_interval_s: i64,
}

impl<'a> Json<'a> for BalloonStatsUpdate {
    type Item = BalloonStatsUpdate;
}

impl BalloonStatsUpdate {
    /// Create a balloon statistics update with the polling interval set to
    /// `sec` seconds.
    pub fn new(sec: i64) -> Self {
        Self {
            stats_polling_interval_s: sec,
        }
    }
}
