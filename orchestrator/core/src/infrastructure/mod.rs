// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod repositories;
pub mod compute;
pub mod db;
pub mod event_bus;
pub mod identity;
pub mod agent_registry;

pub use agent_registry::{HttpAgentRegistry, SimulatedAgentRegistry};
pub use identity::{HttpIdentityProvider, StaticIdentityProvider};
