// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Ledger Factory - Application Layer
//!
//! Creates the concrete `Ledger` for the configured backend, keeping the
//! domain layer free of storage dependencies.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Map `spec.ledger` configuration onto a ledger implementation

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::domain::config::{resolve_secret, LedgerBackendKind, LedgerConfig};
use crate::domain::ledger::{Ledger, LedgerBackend, PostgresConfig, SledConfig};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::{InMemoryLedger, PostgresLedger, SledLedger};

/// Resolve the configured backend, including `env:` database URLs.
pub fn ledger_backend(config: &LedgerConfig) -> Result<LedgerBackend> {
    Ok(match config.backend {
        LedgerBackendKind::Memory => LedgerBackend::InMemory,
        LedgerBackendKind::Sled => LedgerBackend::Sled(SledConfig {
            path: config.path.clone(),
        }),
        LedgerBackendKind::Postgres => {
            let connection_string = resolve_secret(&config.database_url)?
                .context("spec.ledger.database_url is required for the postgres backend")?;
            LedgerBackend::PostgreSQL(PostgresConfig {
                connection_string,
                max_connections: config.max_connections,
            })
        }
    })
}

/// Creates a Ledger implementation based on the configured backend
pub async fn create_ledger(backend: &LedgerBackend) -> Result<Arc<dyn Ledger>> {
    match backend {
        LedgerBackend::InMemory => {
            info!("Using in-memory ledger; lifecycle records will not survive a restart");
            Ok(Arc::new(InMemoryLedger::new()))
        }
        LedgerBackend::Sled(sled) => {
            let ledger = SledLedger::open(&sled.path)
                .with_context(|| format!("Failed to open ledger at {}", sled.path.display()))?;
            info!(path = %sled.path.display(), "Opened sled ledger");
            Ok(Arc::new(ledger))
        }
        LedgerBackend::PostgreSQL(pg) => {
            let database = Database::new(&pg.connection_string, pg.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let ledger = PostgresLedger::new(database.get_pool().clone());
            ledger.migrate().await.context("Failed to apply ledger schema")?;
            info!("Connected to PostgreSQL ledger");
            Ok(Arc::new(ledger))
        }
    }
}
