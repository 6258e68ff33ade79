// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging behind a pluggable sink.

#[macro_use]
pub mod log;
