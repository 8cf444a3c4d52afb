use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Balloon device descriptor for `PATCH /balloon`. Only the target size can
/// be changed after boot; the other balloon properties are left untouched by
/// the hypervisor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BalloonUpdate {
    /// Target balloon size in MiB
    /// Required: true
    #[serde(rename = "amount_mib")]
    pub amount_mib: i64,
}

impl<'a> Json<'a> for BalloonUpdate {
    type Item = BalloonUpdate;
}

impl BalloonUpdate {
    pub fn new(amount_mib: i64) -> Self {
        Self { amount_mib }
    }
}
