use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Balloon device descriptor.
///
/// # Example
///
/// ```
/// // A balloon with target size set to 256 MiB, deflating on out-of-memory
/// // enabled and statistics refreshed every 10 seconds.
/// use firevisor::model::balloon::Balloon;
///
/// let balloon = Balloon::new()
///     .with_amount_mib(256)
///     .set_deflate_on_oom(true)
///     .with_stats_polling_interval_s(10);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Balloon {
    /// Target balloon size in MiB
    /// Required: true
    #[serde(rename = "amount_mib")]
    pub amount_mib: i64,

    /// Whether the balloon should deflate when the guest has memory pressure
    /// Required: true
    #[serde(rename = "deflate_on_oom")]
    pub deflate_on_oom: bool,

    /// Interval in seconds between refreshing statistics. A non-zero value
    /// will enable the statistics. Defaults to 0.
    #[serde(
        rename = "stats_polling_interval_s",
        skip_serializing_if = "Option::is_none"
    )]
    pub stats_polling_interval_s: Option<i64>,
}

impl<'a> Json<'a> for Balloon {
    type Item = Balloon;
}

impl Balloon {
    pub fn new() -> Self {
        Self {
            amount_mib: 0,
            deflate_on_oom: false,
            stats_polling_interval_s: None,
        }
    }

    /// Set target balloon size to `m` MiB.
    pub fn with_amount_mib(mut self, m: i64) -> Self {
        self.amount_mib = m;
        self
    }

    /// Whether the balloon should deflate when the guest has memory pressure.
    pub fn set_deflate_on_oom(mut self, b: bool) -> Self {
        self.deflate_on_oom = b;
        self
    }

    /// Set interval between refreshing statistics to `s` seconds. Whether
    /// statistics are enabled is fixed at boot and cannot be flipped later;
    /// an enabled interval can only be re-tuned.
    pub fn with_stats_polling_interval_s(mut self, s: i64) -> Self {
        self.stats_polling_interval_s = Some(s);
        self
    }
}
