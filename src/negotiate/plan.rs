//! Attempt sequence and the config each attempt uses

use crate::config::{ConnectionConfig, DEFAULT_PORT, LOCALHOST};
use serde::Serialize;

/// Runtime parameter that puts a Greenplum 6+ backend in utility mode
pub const GP_ROLE: &str = "gp_role";
/// Pre-6 spelling of [`GP_ROLE`]
pub const GP_SESSION_ROLE: &str = "gp_session_role";
/// Value both keys take for utility mode
pub const UTILITY: &str = "utility";

/// Which attempt of the sequence a connection (or failure) came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    /// Base config as given
    Direct,
    /// Base config plus `gp_role=utility`
    SegmentGpRole,
    /// Base config plus `gp_session_role=utility`
    SegmentGpSessionRole,
    /// `localhost:5432`, no utility key
    LocalhostFallback,
}

impl AttemptStage {
    /// Every stage, in the order they are tried
    pub const ORDER: [AttemptStage; 4] = [
        AttemptStage::Direct,
        AttemptStage::SegmentGpRole,
        AttemptStage::SegmentGpSessionRole,
        AttemptStage::LocalhostFallback,
    ];

    /// Metric label
    pub fn label(self) -> &'static str {
        match self {
            AttemptStage::Direct => "direct",
            AttemptStage::SegmentGpRole => "gp_role",
            AttemptStage::SegmentGpSessionRole => "gp_session_role",
            AttemptStage::LocalhostFallback => "localhost",
        }
    }

    /// Apply this stage's overrides to a fresh copy of `base`
    pub fn configure(self, base: &ConnectionConfig) -> ConnectionConfig {
        let mut config = base.clone();
        match self {
            AttemptStage::Direct => {}
            AttemptStage::SegmentGpRole => {
                config.remove_runtime_param(GP_SESSION_ROLE);
                config.set_runtime_param(GP_ROLE, UTILITY);
            }
            AttemptStage::SegmentGpSessionRole => {
                config.remove_runtime_param(GP_ROLE);
                config.set_runtime_param(GP_SESSION_ROLE, UTILITY);
            }
            AttemptStage::LocalhostFallback => {
                config.remove_runtime_param(GP_ROLE);
                config.remove_runtime_param(GP_SESSION_ROLE);
                config.set_host(LOCALHOST);
                config.set_port(DEFAULT_PORT);
            }
        }
        config
    }
}

impl std::fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AttemptStage::Direct => "direct connection",
            AttemptStage::SegmentGpRole => "segment utility mode (gp_role)",
            AttemptStage::SegmentGpSessionRole => "segment utility mode (gp_session_role)",
            AttemptStage::LocalhostFallback => "localhost fallback",
        })
    }
}

/// Stages worth trying for `base`; the localhost fallback is dropped when
/// the base already points at `localhost`
pub fn stages_for(base: &ConnectionConfig) -> Vec<AttemptStage> {
    AttemptStage::ORDER
        .into_iter()
        .filter(|stage| *stage != AttemptStage::LocalhostFallback || base.host() != LOCALHOST)
        .collect()
}
