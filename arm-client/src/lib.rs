// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate-limited, retry-aware resource client for the remote cloud API.
//!
//! This crate is the protocol layer every remote-resource operation is built
//! on.  [`RateLimitedRetryClient`] wraps a given wire-level transport (the
//! [`ResourceTransport`] trait) with separate read/write token budgets,
//! sticky throttle back-off, and one-shot classification of responses into
//! the control plane error taxonomy.  It never retries internally; retry
//! policy belongs to its callers.

mod client;
mod limiter;
mod transport;

pub use client::CallKind;
pub use client::RateLimitedRetryClient;
pub use client::Resource;
pub use limiter::RateLimitPolicy;
pub use limiter::RateLimiter;
pub use transport::OperationHandle;
pub use transport::ResourceTransport;
pub use transport::TransportError;
pub use transport::TransportResponse;
