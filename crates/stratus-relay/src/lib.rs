// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Relay - Outbox Event Relay
//!
//! Moves events committed to the outbox table onto the message bus with
//! at-least-once delivery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   Business services          │  write row + enqueue event
//! │   (one DB transaction)       │  in run_in_transaction
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐
//! │   outbox_events table        │
//! └──────┬───────────────┬───────┘
//!        │ claim_batch   │ delete_older_than
//!        ▼               ▼
//! ┌──────────────┐ ┌────────────────┐
//! │ Dispatcher   │ │ Retention      │
//! │ replicas x N │ │ sweeper        │
//! └──────┬───────┘ └────────────────┘
//!        │ publish
//!        ▼
//! ┌──────────────────────────────┐
//! │   Publisher (bus, log, SSE)  │
//! └──────────────────────────────┘
//! ```
//!
//! # Delivery
//!
//! Consumers see each event at least once and dedupe on the envelope `id`.
//! A failed publish is retried with exponential backoff up to `max_retries`
//! attempts, after which the event is dead-lettered as `failed`. A rejected
//! message is dead-lettered immediately.
//!
//! # Configuration
//!
//! The binary reads `STRATUS_*` environment variables; see
//! [`config::Config::from_env`].

#![deny(missing_docs)]

/// Environment configuration.
pub mod config;

/// Dispatcher loop and per-event delivery.
pub mod dispatcher;

/// Relay error types.
pub mod error;

/// Message bus publishers.
pub mod publisher;

/// Embeddable runtime.
pub mod runtime;

/// Retention sweeper.
pub mod sweeper;

pub use config::{Config, ConfigError};
pub use dispatcher::{DispatchReport, DispatcherConfig, RelayDispatcher};
pub use error::{RelayError, Result};
pub use publisher::{
    BroadcastPublisher, BusEnvelope, LogPublisher, MockPublisher, OutboundMessage, PublishError,
    Publisher,
};
pub use runtime::{RelayRuntime, RelayRuntimeBuilder, RelayRuntimeConfig};
pub use sweeper::{RetentionSweeper, SweeperConfig};
