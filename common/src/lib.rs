// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared facilities for the Cirrus control plane: the error taxonomy used by
//! every component, the per-operation context threaded through all calls,
//! retry pacing policies, and configuration.

pub mod api;
pub mod backoff;
pub mod config;
pub mod context;

pub use context::OpContext;
