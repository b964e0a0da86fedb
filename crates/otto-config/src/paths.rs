// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use crate::PathsConfig;

/// Fully resolved runtime paths.
///
/// All relative defaults hang off `agent_dir`; configured overrides are
/// tilde-expanded.  Nothing is created here — directory creation is the
/// lifecycle's job so that `--help` and validation commands never touch
/// the filesystem.
#[derive(Debug, Clone)]
pub struct Paths {
    pub agent_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub socket_path: PathBuf,
    pub schedules_file: PathBuf,
}

impl Paths {
    pub fn resolve(cfg: &PathsConfig, socket_override: Option<&str>) -> Self {
        let agent_dir = cfg
            .agent_dir
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| default_agent_dir());

        let sub = |override_: &Option<String>, name: &str| -> PathBuf {
            override_
                .as_deref()
                .map(expand)
                .unwrap_or_else(|| agent_dir.join(name))
        };

        let sessions_dir = sub(&cfg.sessions_dir, "sessions");
        let workflows_dir = sub(&cfg.workflows_dir, "workflows");
        let runs_dir = sub(&cfg.runs_dir, "runs");
        let workspace_root = sub(&cfg.workspace_root, "workspace");
        let socket_path = socket_override
            .map(expand)
            .unwrap_or_else(|| agent_dir.join("agent.sock"));
        let schedules_file = agent_dir.join("schedules.json");

        Self {
            agent_dir,
            sessions_dir,
            workflows_dir,
            runs_dir,
            workspace_root,
            socket_path,
            schedules_file,
        }
    }
}

fn default_agent_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".otto")
}

fn expand(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).into_owned())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hang_off_agent_dir() {
        let cfg = PathsConfig {
            agent_dir: Some("/srv/otto".into()),
            ..PathsConfig::default()
        };
        let p = Paths::resolve(&cfg, None);
        assert_eq!(p.sessions_dir, PathBuf::from("/srv/otto/sessions"));
        assert_eq!(p.workflows_dir, PathBuf::from("/srv/otto/workflows"));
        assert_eq!(p.runs_dir, PathBuf::from("/srv/otto/runs"));
        assert_eq!(p.workspace_root, PathBuf::from("/srv/otto/workspace"));
        assert_eq!(p.socket_path, PathBuf::from("/srv/otto/agent.sock"));
    }

    #[test]
    fn explicit_overrides_win() {
        let cfg = PathsConfig {
            agent_dir: Some("/srv/otto".into()),
            workspace_root: Some("/data/sandbox".into()),
            ..PathsConfig::default()
        };
        let p = Paths::resolve(&cfg, Some("/run/otto.sock"));
        assert_eq!(p.workspace_root, PathBuf::from("/data/sandbox"));
        assert_eq!(p.socket_path, PathBuf::from("/run/otto.sock"));
    }

    #[test]
    fn tilde_is_expanded() {
        let cfg = PathsConfig {
            agent_dir: Some("~/otto-state".into()),
            ..PathsConfig::default()
        };
        let p = Paths::resolve(&cfg, None);
        assert!(!p.agent_dir.to_string_lossy().starts_with('~'));
    }
}
