use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Defines a token bucket with a maximum capacity (size), an initial burst
/// size (one_time_burst) and an interval for refilling purposes
/// (refill_time). The refill-rate is derived from size and refill_time, and
/// it is the constant rate at which the tokens replenish.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenBucket {
    /// The initial size of a token bucket.
    /// Minimum: 0
    #[serde(rename = "one_time_burst", skip_serializing_if = "Option::is_none")]
    pub one_time_burst: Option<i64>,

    /// The amount of milliseconds it takes for the bucket to refill.
    /// Required: true
    /// Minimum: 0
    #[serde(rename = "refill_time")]
    pub refill_time: i64,

    /// The total number of tokens this bucket can hold.
    /// Required: true
    /// Minimum: 0
    #[serde(rename = "size")]
    pub size: i64,
}

impl<'a> Json<'a> for TokenBucket {
    type Item = TokenBucket;
}
