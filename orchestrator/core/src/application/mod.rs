// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod credential_broker;
pub mod provisioner;
pub mod readiness;
pub mod reaper;
pub mod lifecycle;
pub mod ledger_factory;

// Re-export use cases for convenience
pub use credential_broker::CredentialBroker;
pub use provisioner::{ProvisionError, ResourceProvisioner};
pub use readiness::{ReadinessOutcome, ReadinessWatcher, ReadySignal};
pub use reaper::{Confirmed, Reaper, TeardownError};
pub use lifecycle::{
    ControllerComponents, ControllerError, ControllerSettings, CreateInstanceRequest, LifecycleController,
};
