// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message bus publishers.
//!
//! Provides the [`Publisher`] trait and its implementations:
//! - [`LogPublisher`]: writes envelopes to the tracing log
//! - [`BroadcastPublisher`]: in-process fan-out to subscribers
//! - [`MockPublisher`]: scripted failures for tests

mod broadcast;
mod log;
mod mock;
mod traits;

pub use broadcast::{BroadcastPublisher, DEFAULT_CAPACITY};
pub use log::LogPublisher;
pub use mock::MockPublisher;
pub use traits::{BusEnvelope, OutboundMessage, PublishError, Publisher, Result};
