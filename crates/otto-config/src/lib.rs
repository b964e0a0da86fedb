// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod paths;
mod schema;

pub use loader::load;
pub use paths::Paths;
pub use schema::{
    AgentConfig, Config, ContextConfig, IpcConfig, IpcTransport, LayerBudgetsConfig, MemoryConfig,
    ModelConfig, PathsConfig, ToolsConfig,
};
