// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod condition;
mod engine;
mod registry;
mod run;
mod schema;
mod template;

pub use condition::Condition;
pub use engine::{EngineDeps, WorkflowEngine};
pub use registry::WorkflowRegistry;
pub use run::{Run, RunState, RunStore, StepRecord, StepState};
pub use schema::{plan, validate, Step, StepType, SuccessCheck, Workflow, WorkflowError, WorkflowInput};
pub use template::substitute_args;
