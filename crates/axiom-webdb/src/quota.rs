//! Quota negotiation with the host

use parking_lot::RwLock;
use std::sync::Arc;

use crate::origin::SecurityOrigin;

/// What the host is asked when an origin runs out of space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub origin: SecurityOrigin,
    pub database_name: String,
    pub current_quota: u64,
    pub current_usage: u64,
    /// Lower bound on the usage the origin needs
    pub requested_usage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Raise the origin's quota to this many bytes
    Grant(u64),
    Deny,
}

impl QuotaDecision {
    /// The new quota, if this decision actually raises `current`
    pub fn raised_quota(&self, current: u64) -> Option<u64> {
        match self {
            QuotaDecision::Grant(quota) if *quota > current => Some(*quota),
            _ => None,
        }
    }
}

/// Host hook, run on the script context that owns the database
pub type QuotaHandler = Arc<dyn Fn(&QuotaRequest) -> QuotaDecision + Send + Sync>;

/// A context's current handler, shared with the connections it opened
pub(crate) type QuotaHandlerSlot = Arc<RwLock<Option<QuotaHandler>>>;
