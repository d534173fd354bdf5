// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Compute provider implementations.
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | `docker` | [`docker::DockerComputeProvider`] | local daemon, one container per instance |
//! | `simulated` | [`simulated::SimulatedComputeProvider`] | tests and dry runs |

pub mod docker;
pub mod simulated;

pub use docker::DockerComputeProvider;
pub use simulated::{CreateFault, SimulatedComputeProvider};
