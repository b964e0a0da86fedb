// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bus;
mod claims;
mod event;
pub mod payload;

pub use bus::{EventBus, Handler, SubscriptionId};
pub use claims::{Claim, InputClaims};
pub use event::{Channel, Event, EventType, OUTBOUND_ALLOWLIST};
