// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the Cirrus control plane.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// An error that can be generated within a control plane component.
///
/// Remote responses are classified into this taxonomy exactly once, at the
/// point the response is first observed (the resource client).  Higher layers
/// interpret variants but never re-wrap them; callers can always distinguish
/// "try again later" from "this will never succeed".
///
/// General best practices for error design apply here.  Where possible, we
/// want to reuse existing variants rather than inventing new ones to
/// distinguish cases that no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    ///
    /// Often not fatal: a missing disk during reconciliation means "drop it",
    /// while a missing node is terminal for the call that named it.
    #[error("Object (of type {type_name:?}) not found: {lookup}")]
    NotFound { type_name: ResourceType, lookup: String },

    /// The remote endpoint (or our own admission gate) asked us to pause.
    /// Carries the time at which a retry may be attempted.
    #[error("Request throttled, retry after {retry_after}")]
    Throttled { retry_after: DateTime<Utc> },

    /// The remote model changed underneath us.  Retriable, but only after
    /// re-fetching a fresh model; blind-overwriting is never correct.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// A source resource reference did not match the canonical shape.
    /// The message names the pattern that failed to match.
    #[error("Invalid resource reference: {message}")]
    InvalidReference { message: String },

    /// The disk cannot be attached given its current state or owner.
    #[error("Cannot attach disk: {message}")]
    AttachConflict { message: String },

    /// Every LUN in the node's addressable range is occupied.
    #[error("No available LUN: {message}")]
    NoAvailableLun { message: String },

    /// The caller-supplied deadline expired before the operation completed.
    /// Never retried by this layer.
    #[error("Deadline exceeded: {message}")]
    DeadlineExceeded { message: String },

    /// Any other non-2xx remote response.  Retriability follows the status
    /// class: 5xx is retriable, 4xx is not.
    #[error("Request failed with status {status_code}: {message}")]
    RequestError { status_code: u16, message: String, retriable: bool },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

/// The type of resource named by a lookup failure.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum ResourceType {
    Node,
    Disk,
    ScaleSet,
    ScaleSetInstance,
    Resource,
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried (after a fresh model fetch, in the case of `Conflict`).
    pub fn retryable(&self) -> bool {
        match self {
            Error::Throttled { .. } | Error::Conflict { .. } => true,
            Error::RequestError { retriable, .. } => *retriable,

            Error::NotFound { .. }
            | Error::InvalidReference { .. }
            | Error::AttachConflict { .. }
            | Error::NoAvailableLun { .. }
            | Error::DeadlineExceeded { .. }
            | Error::InternalError { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// For a `Throttled` error, the time after which a retry is permitted.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::Throttled { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn not_found(type_name: ResourceType, lookup: &str) -> Error {
        Error::NotFound { type_name, lookup: lookup.to_owned() }
    }

    pub fn throttled(retry_after: DateTime<Utc>) -> Error {
        Error::Throttled { retry_after }
    }

    pub fn conflict(message: &str) -> Error {
        Error::Conflict { message: message.to_owned() }
    }

    pub fn invalid_reference(message: &str) -> Error {
        Error::InvalidReference { message: message.to_owned() }
    }

    pub fn attach_conflict(message: &str) -> Error {
        Error::AttachConflict { message: message.to_owned() }
    }

    pub fn no_available_lun(message: &str) -> Error {
        Error::NoAvailableLun { message: message.to_owned() }
    }

    pub fn deadline_exceeded(message: &str) -> Error {
        Error::DeadlineExceeded { message: message.to_owned() }
    }

    /// Classifies a non-2xx status into a `RequestError`, deriving
    /// retriability from the status class.
    pub fn request_error(status: http::StatusCode, message: &str) -> Error {
        Error::RequestError {
            status_code: status.as_u16(),
            message: message.to_owned(),
            retriable: status.is_server_error(),
        }
    }

    /// Generates an [`Error::InternalError`] with the specific message.
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime.
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error
    /// with `context` prepended to it.
    ///
    /// Variants whose message is caller-facing rather than operational are
    /// returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::NotFound { .. }
            | Error::Throttled { .. }
            | Error::InvalidReference { .. }
            | Error::AttachConflict { .. }
            | Error::NoAvailableLun { .. }
            | Error::DeadlineExceeded { .. } => self,
            Error::Conflict { message } => Error::Conflict {
                message: format!("{}: {}", context, message),
            },
            Error::RequestError { status_code, message, retriable } => {
                Error::RequestError {
                    status_code,
                    message: format!("{}: {}", context, message),
                    retriable,
                }
            }
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
        }
    }
}

/// Implements a pattern similar to [`anyhow::Context`] for providing extra
/// context for internal error messages.
///
/// Unlike `anyhow::Context`, this does not add a new Error to the cause
/// chain.  It replaces the given Error with one that has the modified
/// message.
pub trait InternalContext<T> {
    fn internal_context<C>(self, s: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    fn with_internal_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}
