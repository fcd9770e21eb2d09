//! Post-connect archiving check

use super::{Warning, WarningKind};
use serde::Serialize;

/// Query for the archive mode setting
pub const SHOW_ARCHIVE_MODE: &str = "show archive_mode";
/// Query for the archive command setting
pub const SHOW_ARCHIVE_COMMAND: &str = "show archive_command";

/// Which health-check query ran (or failed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    /// `show archive_mode`
    ArchiveMode,
    /// `show archive_command`
    ArchiveCommand,
}

impl HealthCheck {
    /// SQL text of the check
    pub fn query(self) -> &'static str {
        match self {
            HealthCheck::ArchiveMode => SHOW_ARCHIVE_MODE,
            HealthCheck::ArchiveCommand => SHOW_ARCHIVE_COMMAND,
        }
    }
}

impl std::fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthCheck::ArchiveMode => "archive_mode",
            HealthCheck::ArchiveCommand => "archive_command",
        })
    }
}

/// `on` and `always` enable WAL archiving; anything else (`off`, unknown) does not
pub fn archiving_enabled(archive_mode: &str) -> bool {
    matches!(archive_mode, "on" | "always")
}

/// Servers report an unset command as the empty string or `(disabled)`
pub fn archive_command_configured(archive_command: &str) -> bool {
    !archive_command.is_empty() && archive_command != "(disabled)"
}

/// Warning for an `archive_mode` value, if it deserves one
pub fn check_archive_mode(value: &str) -> Option<Warning> {
    (!archiving_enabled(value)).then(|| Warning {
        kind: WarningKind::ArchivingDisabled,
        message: format!(
            "archive_mode is '{}': WAL archiving is not enabled, backups will be inconsistent. \
             Please consider configuring WAL archiving.",
            value
        ),
    })
}

/// Warning for an `archive_command` value, if it deserves one
pub fn check_archive_command(value: &str) -> Option<Warning> {
    (!archive_command_configured(value)).then(|| Warning {
        kind: WarningKind::ArchiveCommandMissing,
        message: "archive_command is not configured, backups will be inconsistent. \
                  Please consider configuring WAL archiving."
            .to_string(),
    })
}
