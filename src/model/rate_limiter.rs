use serde::{Deserialize, Serialize};

use crate::utils::Json;

use super::token_bucket::TokenBucket;

/// Defines an IO rate limiter with independent bytes/s and ops/s limits.
/// Limits are defined by configuring each of the `bandwidth` and `ops`
/// token buckets.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimiter {
    #[serde(rename = "bandwidth", skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,

    #[serde(rename = "ops", skip_serializing_if = "Option::is_none")]
    pub ops: Option<TokenBucket>,
}

impl<'a> Json<'a> for RateLimiter {
    type Item = RateLimiter;
}

impl RateLimiter {
    pub fn new(bandwidth: TokenBucket, ops: TokenBucket) -> Self {
        Self {
            bandwidth: Some(bandwidth),
            ops: Some(ops),
        }
    }
}

/// A pair of rate limiters, one per direction, applied to an interface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimiterSet {
    /// limits the incoming bytes
    pub in_rate_limiter: Option<RateLimiter>,

    /// limits the outgoing bytes
    pub out_rate_limiter: Option<RateLimiter>,
}
