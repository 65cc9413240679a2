//! Database details snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the tracker knows about one database at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDetails {
    pub name: String,
    pub display_name: String,
    /// Size the page asked for when it opened the database
    pub expected_usage: u64,
    /// Committed size on disk
    pub current_usage: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
}
