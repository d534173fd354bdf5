// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Ember orchestrator core
//!
//! Provisions one ephemeral build agent per job in a foreign trust domain,
//! waits for it to register, hands it exactly one job, and guarantees the
//! compute unit is torn down afterwards, across orchestrator restarts.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Layout:** `domain` (aggregate, value objects, provider traits),
//!   `application` (broker, provisioner, readiness, reaper, controller),
//!   `infrastructure` (ledgers, compute, identity, registry, event bus),
//!   `presentation` (HTTP API)

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
