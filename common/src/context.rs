// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-operation context threaded through every control plane call.

use crate::api::Error;
use slog::Logger;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Context for one caller-visible operation.
///
/// Carries the structured logger for the operation and an optional deadline.
/// The deadline applies to suspension points that block on the network; a
/// deadline that expires mid-operation surfaces as
/// [`Error::DeadlineExceeded`] and is never retried by this layer.
#[derive(Clone, Debug)]
pub struct OpContext {
    log: Logger,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new(log: &Logger) -> OpContext {
        OpContext { log: log.clone(), deadline: None }
    }

    /// Returns a context whose network suspension points give up after
    /// `timeout` from now.
    pub fn with_deadline(&self, timeout: Duration) -> OpContext {
        OpContext {
            log: self.log.clone(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Runs `future` to completion, bounded by this context's deadline.
    ///
    /// With no deadline set, this is just `future.await`.  `what` names the
    /// operation in the `DeadlineExceeded` message.
    pub async fn run_until_deadline<T, F>(
        &self,
        what: &str,
        future: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match self.deadline {
            None => future.await,
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, future).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::deadline_exceeded(what)),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::OpContext;
    use crate::api::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn test_no_deadline_runs_to_completion() {
        let opctx = OpContext::new(&test_logger());
        let result = opctx
            .run_until_deadline("noop", async { Ok::<_, Error>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let opctx = OpContext::new(&test_logger())
            .with_deadline(Duration::from_millis(50));
        let result = opctx
            .run_until_deadline("slow remote call", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Error>(())
            })
            .await;
        assert_matches!(result, Err(Error::DeadlineExceeded { message })
            if message == "slow remote call");
    }
}
