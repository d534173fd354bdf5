// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Value objects, the `LifecycleInstance` aggregate, and the traits the
//! application layer depends on.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Lifecycle model and collaborator contracts

pub mod lifecycle;
pub mod retry;
pub mod credentials;
pub mod compute;
pub mod agent_registry;
pub mod ledger;
pub mod events;
pub mod config;
