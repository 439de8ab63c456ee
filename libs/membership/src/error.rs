//! Error types for membership operations.
//!
//! Consumers can tell substrate transport failures apart from registration
//! conflicts, lease loss and watch termination without depending on the
//! etcd client's error type.

use thiserror::Error;

use crate::models::LeaseId;

/// Top-level error type for the membership crate.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The substrate is unreachable or a transport-level call failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Conditional create lost every attempt for the registration key.
    #[error("registration conflict on '{key}' after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    /// The keepalive stream for the registration lease ended.
    #[error("lease {0} lost")]
    LeaseLost(LeaseId),

    /// The watch stream ended; the instance no longer follows the prefix.
    #[error("watch terminated: {0}")]
    WatchTerminated(String),

    /// The requested resume revision was compacted away by the substrate.
    #[error("revision {requested} compacted (compact revision {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// The substrate connection has been closed.
    #[error("substrate connection closed")]
    Closed,
}

impl MembershipError {
    /// Returns true if the failure is transient and the caller may retry
    /// (transport errors and lost create races).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MembershipError::Connection(_) | MembershipError::Conflict { .. }
        )
    }

    /// Returns true if this error is a registration conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MembershipError::Conflict { .. })
    }

    /// Returns true if the error ends the instance for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MembershipError::LeaseLost(_)
                | MembershipError::WatchTerminated(_)
                | MembershipError::Compacted { .. }
                | MembershipError::Closed
        )
    }
}

/// Shorthand result alias for membership operations.
pub type MembershipResult<T> = Result<T, MembershipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conn = MembershipError::Connection("conn refused".into());
        assert!(conn.is_retryable());
        assert!(!conn.is_conflict());
        assert!(!conn.is_terminal());

        let conflict = MembershipError::Conflict {
            key: "/svc/a".into(),
            attempts: 10,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());

        let lost = MembershipError::LeaseLost(7);
        assert!(!lost.is_retryable());
        assert!(lost.is_terminal());

        let compacted = MembershipError::Compacted {
            requested: 3,
            compacted: 9,
        };
        assert!(compacted.is_terminal());

        let config = MembershipError::Config("empty prefix".into());
        assert!(!config.is_retryable());
        assert!(!config.is_terminal());

        assert!(MembershipError::Closed.is_terminal());
        assert!(MembershipError::WatchTerminated("eof".into()).is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = MembershipError::Conflict {
            key: "/svc/1111".into(),
            attempts: 10,
        };
        let msg = format!("{err}");
        assert!(msg.contains("'/svc/1111'"));
        assert!(msg.contains("10 attempts"));

        let err = MembershipError::Compacted {
            requested: 4,
            compacted: 12,
        };
        assert_eq!(format!("{err}"), "revision 4 compacted (compact revision 12)");
    }
}
