// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod contract;
mod parser;
mod turn;

pub use contract::{derive_contract, verify, Intent, Scope, TaskContract, VerificationFailure, Verifier, WriteCheck};
pub use parser::{parse_completion, ParseResult};
pub use turn::{TurnLoop, TurnLoopDeps};
