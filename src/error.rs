use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while inspecting a target image.
///
/// Only [`Error::MisconfiguredTarget`] stops an invocation. Every other variant is recorded as a
/// diagnostic on the report being built, and the traversal carries on with the next region or pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("corrupt heap node at {address:#x}: {reason}")]
    CorruptHeap { address: u64, reason: &'static str },

    #[error("corrupt pool `{pool}` at {address:#x}: {reason}")]
    CorruptPool {
        pool: String,
        address: u64,
        reason: &'static str,
    },

    #[error("unreadable memory at {address:#x} ({len} bytes)")]
    UnreadableMemory { address: u64, len: u64 },

    #[error("misconfigured target: {0}")]
    MisconfiguredTarget(String),
}

impl Error {
    /// Whether the error must abort the current invocation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MisconfiguredTarget(_))
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_only_treat_configuration_as_fatal() {
        assert!(Error::MisconfiguredTarget("alignment".to_string()).is_fatal());
        assert!(
            !Error::CorruptHeap {
                address: 0x10,
                reason: "zero sized node"
            }
            .is_fatal()
        );
        assert!(
            !Error::UnreadableMemory {
                address: 0x10,
                len: 8
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_should_name_address_in_message() {
        let error = Error::CorruptPool {
            pool: "pool-32".to_string(),
            address: 0x2000_0040,
            reason: "expansion queue cycles",
        };
        assert_eq!(
            error.to_string(),
            "corrupt pool `pool-32` at 0x20000040: expansion queue cycles"
        );
    }
}
