// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{ExponentialBackoff, Notify};

/// Return a backoff policy for mutations against the remote cloud API.
///
/// Bounded: a flush that keeps hitting throttling or conflicts gives up once
/// the elapsed budget is spent, surfacing the last classified error.
pub fn remote_mutation_policy() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(500);
    const MAX_INTERVAL: Duration = Duration::from_secs(30);
    const MAX_ELAPSED: Duration = Duration::from_secs(120);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(MAX_ELAPSED))
}

/// Return a backoff policy for re-reading remote state, which is expected to
/// settle in a relatively shorter amount of time than a mutation.
pub fn remote_read_policy() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(100);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    const MAX_ELAPSED: Duration = Duration::from_secs(30);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(MAX_ELAPSED))
}

pub fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..backoff::ExponentialBackoff::default()
    }
}
