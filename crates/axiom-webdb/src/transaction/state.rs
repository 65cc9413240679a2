//! Transaction State Machine
//!
//! ```text
//! AcquireLock
//!   ↓ granted
//! OpenTransactionAndPreflight
//!   ↓ BEGIN, version check
//! DeliverTransactionCallback
//!   ↓
//! RunStatements ⇄ DeliverStatementCallback
//!   │           ⇄ DeliverQuotaIncreaseCallback (then the same statement again)
//!   │           ⇄ DeliverStatementErrorCallback (when it continues)
//!   ↓ queue empty
//! PostflightAndCommit → DeliverSuccessCallback ─────────────┐
//!                                                           ↓
//! (any failure) HandleTransactionError → DeliverTransactionErrorCallback
//!                                                           ↓
//!                                               CleanupAndTerminate → End
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TransactionState {
    AcquireLock,
    OpenTransactionAndPreflight,
    DeliverTransactionCallback,
    RunStatements,
    DeliverStatementCallback,
    DeliverQuotaIncreaseCallback,
    DeliverStatementErrorCallback,
    PostflightAndCommit,
    DeliverSuccessCallback,
    /// Roll back and release the lock
    HandleTransactionError,
    DeliverTransactionErrorCallback,
    CleanupAndTerminate,
    End,
}

impl TransactionState {
    pub fn can_transition_to(&self, target: TransactionState) -> bool {
        use TransactionState::*;

        match (self, target) {
            // Errors can surface anywhere before a terminal callback
            (
                AcquireLock
                | OpenTransactionAndPreflight
                | DeliverTransactionCallback
                | RunStatements
                | DeliverStatementCallback
                | DeliverQuotaIncreaseCallback
                | DeliverStatementErrorCallback
                | PostflightAndCommit,
                HandleTransactionError,
            ) => true,
            (AcquireLock, OpenTransactionAndPreflight) => true,
            (OpenTransactionAndPreflight, DeliverTransactionCallback) => true,
            (DeliverTransactionCallback, RunStatements) => true,
            (
                RunStatements,
                DeliverStatementCallback
                | DeliverQuotaIncreaseCallback
                | DeliverStatementErrorCallback
                | PostflightAndCommit,
            ) => true,
            (DeliverStatementCallback, RunStatements) => true,
            (DeliverQuotaIncreaseCallback, RunStatements | DeliverStatementErrorCallback) => true,
            (DeliverStatementErrorCallback, RunStatements) => true,
            (PostflightAndCommit, DeliverSuccessCallback) => true,
            (HandleTransactionError, DeliverTransactionErrorCallback) => true,
            (DeliverSuccessCallback | DeliverTransactionErrorCallback, CleanupAndTerminate) => true,
            (CleanupAndTerminate, End) => true,
            _ => false,
        }
    }

    /// States that hand control to the script context
    pub fn is_callback_delivery(&self) -> bool {
        matches!(
            self,
            TransactionState::DeliverTransactionCallback
                | TransactionState::DeliverStatementCallback
                | TransactionState::DeliverQuotaIncreaseCallback
                | TransactionState::DeliverStatementErrorCallback
                | TransactionState::DeliverSuccessCallback
                | TransactionState::DeliverTransactionErrorCallback
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::AcquireLock => "acquire_lock",
            TransactionState::OpenTransactionAndPreflight => "open_transaction_and_preflight",
            TransactionState::DeliverTransactionCallback => "deliver_transaction_callback",
            TransactionState::RunStatements => "run_statements",
            TransactionState::DeliverStatementCallback => "deliver_statement_callback",
            TransactionState::DeliverQuotaIncreaseCallback => "deliver_quota_increase_callback",
            TransactionState::DeliverStatementErrorCallback => "deliver_statement_error_callback",
            TransactionState::PostflightAndCommit => "postflight_and_commit",
            TransactionState::DeliverSuccessCallback => "deliver_success_callback",
            TransactionState::HandleTransactionError => "handle_transaction_error",
            TransactionState::DeliverTransactionErrorCallback => {
                "deliver_transaction_error_callback"
            }
            TransactionState::CleanupAndTerminate => "cleanup_and_terminate",
            TransactionState::End => "end",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
