//! # Request Context
//!
//! A small per-request marker threaded through extensions by
//! [`crate::middleware::logging_middleware`]: a request id for correlating
//! log lines and response headers, and a start time for latency tracking.
//! There is no user/API-key identity to carry here — ingress auth has no
//! concept of an end user (see `crate::auth`), so this deliberately stays
//! thin rather than growing fields that would never be populated.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
}

impl RequestContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            start_time: Instant::now(),
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}
