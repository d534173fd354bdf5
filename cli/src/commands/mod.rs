// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Ember CLI

pub mod config;
pub mod daemon;
pub mod instance;

pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
pub use self::instance::InstanceCommand;
