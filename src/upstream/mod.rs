pub mod rate_limiter;
pub mod token_broker;

use std::time::Duration;

pub use rate_limiter::RateLimiter;
pub use token_broker::{BrokerState, Credentials, Secret, TokenBroker};

use crate::error::Result;

/// Shared HTTP client for the token and data endpoints.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
