//! Request and token accounting, with limits that stop a run before it
//! overspends.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::error::UsageLimitExceeded;

/// Requests made and tokens spent so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u64,
    pub request_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

fn add_tokens(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

impl Usage {
    /// Add the tokens of `other` and count `requests` more requests.
    pub fn incr(&mut self, other: &Usage, requests: u64) {
        self.requests += requests;
        self.request_tokens = add_tokens(self.request_tokens, other.request_tokens);
        self.response_tokens = add_tokens(self.response_tokens, other.response_tokens);
        self.total_tokens = add_tokens(self.total_tokens, other.total_tokens);
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(mut self, other: Usage) -> Usage {
        self.incr(&other, other.requests);
        self
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        self.incr(&other, other.requests);
    }
}

/// Caps on a [`Usage`]. Unset limits are not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLimits {
    pub request_limit: Option<u64>,
    pub request_tokens_limit: Option<u64>,
    pub response_tokens_limit: Option<u64>,
    pub total_tokens_limit: Option<u64>,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            request_limit: Some(50),
            request_tokens_limit: None,
            response_tokens_limit: None,
            total_tokens_limit: None,
        }
    }
}

impl UsageLimits {
    pub fn has_token_limits(&self) -> bool {
        self.request_tokens_limit.is_some()
            || self.response_tokens_limit.is_some()
            || self.total_tokens_limit.is_some()
    }

    /// Fails if one more request would go over `request_limit`.
    pub fn check_before_request(&self, usage: &Usage) -> Result<(), UsageLimitExceeded> {
        if let Some(limit) = self.request_limit
            && usage.requests >= limit
        {
            return Err(UsageLimitExceeded::new(format!(
                "The next request would exceed the request_limit of {limit}"
            )));
        }
        Ok(())
    }

    /// Fails if any token count is already over its limit.
    pub fn check_tokens(&self, usage: &Usage) -> Result<(), UsageLimitExceeded> {
        let checks = [
            ("request_tokens", self.request_tokens_limit, usage.request_tokens),
            ("response_tokens", self.response_tokens_limit, usage.response_tokens),
            ("total_tokens", self.total_tokens_limit, usage.total_tokens),
        ];

        for (name, limit, count) in checks {
            let count = count.unwrap_or(0);
            if let Some(limit) = limit
                && count > limit
            {
                return Err(UsageLimitExceeded::new(format!(
                    "Exceeded the {name}_limit of {limit} ({name}={count})"
                )));
            }
        }
        Ok(())
    }
}
