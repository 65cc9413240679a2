//! Preflight and postflight hooks
//!
//! Ordinary transactions check the handle's expected version against the
//! stored one. Version changes check the caller's old version instead, write
//! the new one just before commit, and undo the cached side effect if the
//! commit itself then fails.

use axiom_storage::SqliteDatabase;

use crate::backend::{self, DatabaseBackend};
use crate::error::{SqlError, SqlErrorCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PreflightOutcome {
    Proceed,
    Fail(SqlError),
}

#[derive(Debug)]
pub(crate) enum TransactionWrapper {
    Standard,
    ChangeVersion {
        old_version: String,
        new_version: String,
        /// Expected version before postflight replaced it
        replaced: Option<String>,
    },
}

impl TransactionWrapper {
    pub fn change_version(old_version: impl Into<String>, new_version: impl Into<String>) -> Self {
        TransactionWrapper::ChangeVersion {
            old_version: old_version.into(),
            new_version: new_version.into(),
            replaced: None,
        }
    }

    /// Runs right after `BEGIN`, with `actual` read inside the transaction
    pub fn preflight(&self, database: &DatabaseBackend, actual: &str) -> PreflightOutcome {
        match self {
            TransactionWrapper::Standard => {
                let expected = database.expected_version();
                if !expected.is_empty() && expected != actual {
                    return PreflightOutcome::Fail(SqlError::new(
                        SqlErrorCode::Version,
                        format!(
                            "unable to open database, version mismatch, '{expected}' does not match the currentVersion of '{actual}'"
                        ),
                    ));
                }
                PreflightOutcome::Proceed
            }
            TransactionWrapper::ChangeVersion { old_version, .. } => {
                if old_version != actual {
                    return PreflightOutcome::Fail(SqlError::new(
                        SqlErrorCode::Version,
                        "current version of the database and `oldVersion` argument do not match",
                    ));
                }
                PreflightOutcome::Proceed
            }
        }
    }

    /// Runs right before `COMMIT`
    pub fn postflight(
        &mut self,
        database: &DatabaseBackend,
        conn: &SqliteDatabase,
    ) -> std::result::Result<(), SqlError> {
        let TransactionWrapper::ChangeVersion {
            new_version,
            replaced,
            ..
        } = self
        else {
            return Ok(());
        };

        backend::write_version(conn, new_version).map_err(|e| {
            SqlError::new(
                SqlErrorCode::Unknown,
                format!("unable to set new version in database ({e})"),
            )
        })?;
        *replaced = Some(database.replace_expected_version(new_version.clone()));
        database.cache_version(new_version);
        Ok(())
    }

    pub fn handle_commit_failed_after_postflight(&mut self, database: &DatabaseBackend) {
        if let TransactionWrapper::ChangeVersion {
            old_version,
            replaced,
            ..
        } = self
        {
            if let Some(previous) = replaced.take() {
                database.replace_expected_version(previous);
            }
            database.cache_version(old_version);
        }
    }

    pub fn is_version_change(&self) -> bool {
        matches!(self, TransactionWrapper::ChangeVersion { .. })
    }
}
