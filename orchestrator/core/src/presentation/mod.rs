// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`ember-core`)
//!
//! HTTP surface that translates external requests into controller calls.
//! **No business logic lives here**: all real work is delegated to
//! `crate::application::lifecycle::LifecycleController`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | REST endpoints + Server-Sent Events for lifecycle streaming |

pub mod api;
