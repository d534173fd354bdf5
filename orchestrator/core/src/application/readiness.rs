// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Readiness Watcher
//!
//! Waits for a provisioned resource to self-register with the work-receiving
//! system. Provisioning success says nothing about readiness: boot failures,
//! partitions and broken images all show up as an agent that never comes
//! online, so the wait is always bounded by a deadline. `TimedOut` is an
//! ordinary outcome, not an error.
//!
//! Every poll is delayed by a random jitter so that many instances booting
//! at once do not poll the registry in lockstep.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::agent_registry::{AgentRegistry, AgentStatus};
use crate::domain::lifecycle::ResourceHandle;
use crate::domain::retry::jitter_up_to;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySignal {
    pub observed_at: DateTime<Utc>,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready(ReadySignal),
    TimedOut { polls: u32 },
}

pub struct ReadinessWatcher {
    registry: Arc<dyn AgentRegistry>,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl ReadinessWatcher {
    pub fn new(registry: Arc<dyn AgentRegistry>, poll_interval: Duration, poll_jitter: Duration) -> Self {
        Self {
            registry,
            poll_interval,
            poll_jitter,
        }
    }

    pub async fn await_ready(
        &self,
        handle: &ResourceHandle,
        agent_label: &str,
        deadline: Instant,
    ) -> ReadinessOutcome {
        let mut polls = 0;
        // The first poll is only jittered so fresh instances spread out immediately.
        let mut wait = jitter_up_to(self.poll_jitter);

        loop {
            let next_poll = Instant::now() + wait;
            if next_poll >= deadline {
                tokio::time::sleep_until(deadline).await;
                debug!(handle = %handle, agent_label, polls, "Readiness deadline elapsed");
                return ReadinessOutcome::TimedOut { polls };
            }
            tokio::time::sleep_until(next_poll).await;

            polls += 1;
            match tokio::time::timeout_at(deadline, self.registry.describe_status(agent_label)).await {
                Err(_) => return ReadinessOutcome::TimedOut { polls },
                Ok(Ok(AgentStatus::Online)) => {
                    debug!(handle = %handle, agent_label, polls, "Agent registered");
                    return ReadinessOutcome::Ready(ReadySignal {
                        observed_at: Utc::now(),
                        polls,
                    });
                }
                Ok(Ok(AgentStatus::Offline)) => {}
                Ok(Err(e)) => {
                    // A registry hiccup is indistinguishable from "not yet online".
                    warn!(handle = %handle, agent_label, "Registry poll failed: {}", e);
                }
            }

            wait = self.poll_interval + jitter_up_to(self.poll_jitter);
        }
    }
}
