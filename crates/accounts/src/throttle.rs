//! Outbound provider-call throttle
//!
//! Queued token bucket keyed per account: callers await their turn instead
//! of failing, so a chatty account slows itself down without starving the
//! others.

use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tminus_core::types::AccountId;

pub struct AccountThrottle {
    limiter: DefaultKeyedRateLimiter<AccountId>,
}

impl AccountThrottle {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        AccountThrottle {
            limiter: RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    /// Wait until this account is allowed one more provider call
    pub async fn acquire(&self, account_id: AccountId) {
        self.limiter.until_key_ready(&account_id).await;
    }
}
