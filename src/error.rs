//! Error types for Keystone
//!
//! Two layers of errors exist:
//! - [`XaError`] is what a resource manager reports for a single branch
//!   operation. It carries an X/Open XA return code.
//! - [`TxError`] is what the coordinator and the transaction manager report
//!   to their callers. Per-resource failures are folded into the aggregate
//!   protocol outcome, so most `XaError`s never surface directly.

use std::fmt;
use std::io;

/// X/Open XA return and error codes (subset used by the coordinator)
pub mod xa_codes {
    /// Normal execution.
    pub const XA_OK: i32 = 0;
    /// The branch was read-only and has been committed.
    pub const XA_RDONLY: i32 = 3;
    /// Routine returned with no effect and may be reissued.
    pub const XA_RETRY: i32 = 4;
    /// The branch was partially committed and partially rolled back.
    pub const XA_HEURMIX: i32 = 5;
    /// The branch was heuristically rolled back.
    pub const XA_HEURRB: i32 = 6;
    /// The branch was heuristically committed.
    pub const XA_HEURCOM: i32 = 7;
    /// The branch may have been heuristically completed.
    pub const XA_HEURHAZ: i32 = 8;

    /// Lower bound of the rollback codes.
    pub const XA_RBBASE: i32 = 100;
    /// Rollback for an unspecified reason.
    pub const XA_RBROLLBACK: i32 = XA_RBBASE;
    pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
    pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
    pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
    pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
    pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
    /// The branch took too long.
    pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
    pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
    /// Upper bound of the rollback codes.
    pub const XA_RBEND: i32 = XA_RBTRANSIENT;

    /// Asynchronous operation already outstanding.
    pub const XAER_ASYNC: i32 = -2;
    /// A resource manager error occurred in the branch.
    pub const XAER_RMERR: i32 = -3;
    /// The XID is not valid (unknown to the resource manager).
    pub const XAER_NOTA: i32 = -4;
    /// Invalid arguments were given.
    pub const XAER_INVAL: i32 = -5;
    /// Routine invoked in an improper context.
    pub const XAER_PROTO: i32 = -6;
    /// Resource manager unavailable.
    pub const XAER_RMFAIL: i32 = -7;
    /// The XID already exists.
    pub const XAER_DUPID: i32 = -8;
    /// Resource manager doing work outside the global transaction.
    pub const XAER_OUTSIDE: i32 = -9;
}

use xa_codes::*;

/// An error reported by a resource manager for one branch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaError {
    /// XA return code
    pub code: i32,
    /// Human-readable detail
    pub message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an error carrying only a code
    pub fn code(code: i32) -> Self {
        Self::new(code, xa_code_name(code))
    }

    /// The branch was (or will be) rolled back by the resource manager
    pub fn is_rollback(&self) -> bool {
        (XA_RBBASE..=XA_RBEND).contains(&self.code)
    }

    /// The resource manager completed the branch on its own
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self.code,
            XA_HEURMIX | XA_HEURRB | XA_HEURCOM | XA_HEURHAZ
        )
    }

    /// The operation may succeed if reissued later
    pub fn is_transient(&self) -> bool {
        matches!(self.code, XA_RETRY | XAER_RMFAIL)
    }

    /// The resource manager does not know the branch
    pub fn is_unknown_branch(&self) -> bool {
        self.code == XAER_NOTA
    }
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, xa_code_name(self.code))
    }
}

impl std::error::Error for XaError {}

/// Symbolic name of an XA code, for log messages
pub fn xa_code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "XA_UNKNOWN",
    }
}

/// Unified error type for transaction operations
#[derive(Debug)]
pub enum TxError {
    /// I/O error (log files)
    Io(io::Error),
    /// Log record encoding or decoding failed
    Codec(String),
    /// JSON-related error (configuration, keypoint markers)
    Json(String),
    /// Invalid configuration
    Config(String),
    /// Requested feature is not supported (e.g. nested transactions)
    NotSupported(String),
    /// Operation invoked in the wrong protocol state
    IllegalState(String),
    /// The transaction object is not usable for this operation
    InvalidTransaction(String),
    /// Coordination has already started completing
    Inactive(String),
    /// `commit` called without a successful `prepare`
    NotPrepared(String),
    /// The transaction was rolled back instead of committed
    Rollback(String),
    /// Some branches committed and some rolled back
    HeuristicMixed(String),
    /// Every branch was heuristically rolled back
    HeuristicRollback(String),
    /// The outcome of some branches is unknown
    HeuristicHazard(String),
    /// Branches committed although rollback was requested
    HeuristicCommit(String),
    /// Unexpected failure; the outcome may be resolved by recovery
    System(String),
    /// Caller is not allowed to perform the operation
    Security(String),
    /// A resource manager error surfaced directly
    Resource(XaError),
}

impl TxError {
    /// Rollback error carrying the standard time-out cause
    pub fn timed_out() -> Self {
        TxError::Rollback("Transaction rolled back due to time out".to_string())
    }

    /// True for the heuristic family, which requires manual reconciliation
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            TxError::HeuristicMixed(_)
                | TxError::HeuristicRollback(_)
                | TxError::HeuristicHazard(_)
                | TxError::HeuristicCommit(_)
        )
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Io(e) => write!(f, "I/O error: {}", e),
            TxError::Codec(msg) => write!(f, "Log codec error: {}", msg),
            TxError::Json(msg) => write!(f, "JSON error: {}", msg),
            TxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TxError::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            TxError::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            TxError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            TxError::Inactive(msg) => write!(f, "Transaction inactive: {}", msg),
            TxError::NotPrepared(msg) => write!(f, "Transaction not prepared: {}", msg),
            TxError::Rollback(msg) => write!(f, "{}", msg),
            TxError::HeuristicMixed(msg) => write!(f, "Heuristic mixed outcome: {}", msg),
            TxError::HeuristicRollback(msg) => write!(f, "Heuristic rollback: {}", msg),
            TxError::HeuristicHazard(msg) => write!(f, "Heuristic hazard: {}", msg),
            TxError::HeuristicCommit(msg) => write!(f, "Heuristic commit: {}", msg),
            TxError::System(msg) => write!(f, "System error: {}", msg),
            TxError::Security(msg) => write!(f, "Security error: {}", msg),
            TxError::Resource(e) => write!(f, "Resource error: {}", e),
        }
    }
}

impl std::error::Error for TxError {}

impl From<io::Error> for TxError {
    fn from(e: io::Error) -> Self {
        TxError::Io(e)
    }
}

impl From<serde_json::Error> for TxError {
    fn from(e: serde_json::Error) -> Self {
        TxError::Json(e.to_string())
    }
}

impl From<bincode::Error> for TxError {
    fn from(e: bincode::Error) -> Self {
        TxError::Codec(e.to_string())
    }
}

impl From<XaError> for TxError {
    fn from(e: XaError) -> Self {
        TxError::Resource(e)
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TxError>;

/// Result type alias for resource manager operations
pub type XaResult<T> = std::result::Result<T, XaError>;
