// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shipyard Core - domain model and persistence
//!
//! This crate holds the entities the image-builder lifecycle reads and writes
//! (context versions with their inline build sub-document, builds, instances,
//! isolations) together with the lease table and the job outbox used by the
//! queue workers.
//!
//! # Storage
//!
//! | Backend | URL scheme | Notes |
//! |---------|------------|-------|
//! | PostgreSQL | `postgres://` | Multi-process deployments |
//! | SQLite | `sqlite:` | Single host and tests |
//!
//! Both backends implement [`persistence::Persistence`]. Every build state
//! transition is a single conditional statement, so workers in different
//! processes can race on the same context version without coordination.
//!
//! # Build lifecycle
//!
//! ```text
//! build.started ──► dockerContainer set ──► containerStarted ──► completed
//!                   (state build_started)                        (failed = exit code != 0)
//! ```
//!
//! A completed build never returns to an earlier state.

#![deny(missing_docs)]

/// Database configuration loaded from environment variables.
pub mod config;

/// Error types for persistence operations.
pub mod error;

/// Embedded schema migrations for PostgreSQL and SQLite.
pub mod migrations;

/// Domain entities.
pub mod model;

/// Persistence trait and database backends.
pub mod persistence;

pub use error::{CoreError, Result};
pub use persistence::Persistence;
