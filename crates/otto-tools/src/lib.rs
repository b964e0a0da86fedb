// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod policy;
mod registry;
mod rollback;
mod tool;
mod validate;

pub use policy::ToolPolicy;
pub use registry::{ToolRegistry, ToolSchema};
pub use rollback::WriteRollback;
pub use tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

pub use builtin::bash::BashTool;
pub use builtin::edit_file::EditTool;
pub use builtin::patch::PatchTool;
pub use builtin::read_file::ReadTool;
pub use builtin::write_file::WriteTool;

/// Register the builtin tool set.
pub fn register_builtins(registry: &mut ToolRegistry, cfg: &otto_config::ToolsConfig) {
    registry.register(BashTool {
        timeout_secs: cfg.bash_timeout_secs,
    });
    registry.register(ReadTool);
    registry.register(WriteTool);
    registry.register(EditTool);
    registry.register(PatchTool);
}
