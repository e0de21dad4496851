//! Engine configuration.

use sbt_error::{Result, SbtError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_INITIAL_PATHS: usize = 8;
const DEFAULT_PATH_SOFT_LIMIT: usize = 64;
const DEFAULT_MAX_PATHS: usize = 256;
const DEFAULT_ARENA_INITIAL_BYTES: usize = 4096;
const DEFAULT_ARENA_MAX_BYTES: usize = 1 << 20;
const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(10);
const DEFAULT_NODE_FANOUT: usize = 16;

/// Tunables held by the filesystem context and read by every transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtreeConfig {
    /// Path-table capacity a fresh transaction starts with.
    pub initial_paths: usize,
    /// Allocated paths above which unreferenced paths are reclaimed.
    pub path_soft_limit: usize,
    /// Hard limit; past it allocation restarts with `TooManyPaths`.
    pub max_paths: usize,
    pub arena_initial_bytes: usize,
    /// The bump arena never regrows past this; larger demand stays on the heap.
    pub arena_max_bytes: usize,
    /// Bounded wait on the blocking lock slow path.
    pub lock_wait: Duration,
    /// Debug builds only: restart roughly one traversal in N.
    pub inject_restart_one_in: Option<u32>,
    /// Record every traversal lock acquisition.
    pub trace_locks: bool,
    /// Keys or children per node for the bulk tree builder.
    pub node_fanout: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            initial_paths: DEFAULT_INITIAL_PATHS,
            path_soft_limit: DEFAULT_PATH_SOFT_LIMIT,
            max_paths: DEFAULT_MAX_PATHS,
            arena_initial_bytes: DEFAULT_ARENA_INITIAL_BYTES,
            arena_max_bytes: DEFAULT_ARENA_MAX_BYTES,
            lock_wait: DEFAULT_LOCK_WAIT,
            inject_restart_one_in: None,
            trace_locks: false,
            node_fanout: DEFAULT_NODE_FANOUT,
        }
    }
}

impl BtreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_paths == 0 || self.max_paths > usize::from(u16::MAX) {
            return Err(SbtError::Invalid(format!(
                "max_paths must be in 1..={}, got {}",
                u16::MAX,
                self.max_paths
            )));
        }
        if self.path_soft_limit > self.max_paths {
            return Err(SbtError::Invalid(format!(
                "path_soft_limit {} exceeds max_paths {}",
                self.path_soft_limit, self.max_paths
            )));
        }
        if self.initial_paths == 0 || self.initial_paths > self.max_paths {
            return Err(SbtError::Invalid(format!(
                "initial_paths must be in 1..={}, got {}",
                self.max_paths, self.initial_paths
            )));
        }
        if self.arena_initial_bytes > self.arena_max_bytes {
            return Err(SbtError::Invalid(
                "arena_initial_bytes exceeds arena_max_bytes".into(),
            ));
        }
        if self.node_fanout < 2 {
            return Err(SbtError::Invalid("node_fanout must be at least 2".into()));
        }
        if self.inject_restart_one_in == Some(0) {
            return Err(SbtError::Invalid(
                "inject_restart_one_in must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        BtreeConfig::default()
            .validate()
            .expect("default config should validate");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: BtreeConfig =
            serde_json::from_str(r#"{ "max_paths": 32, "path_soft_limit": 16, "trace_locks": true }"#)
                .expect("config json should parse");
        assert_eq!(cfg.max_paths, 32);
        assert!(cfg.trace_locks);
        assert_eq!(cfg.lock_wait, DEFAULT_LOCK_WAIT);
        assert_eq!(cfg.node_fanout, DEFAULT_NODE_FANOUT);
        cfg.validate().expect("partial config should validate");
    }

    #[test]
    fn rejects_inconsistent_limits() {
        let cfg = BtreeConfig {
            path_soft_limit: 300,
            ..BtreeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(SbtError::Invalid(_))));

        let cfg = BtreeConfig {
            max_paths: 100_000,
            ..BtreeConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BtreeConfig {
            inject_restart_one_in: Some(0),
            ..BtreeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
