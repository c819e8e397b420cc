//! Error types for accelerator runtime operations.
//!
//! Every call into an accelerator runtime returns a [`Result`]; the
//! abstraction itself never terminates the process. Callers that want the
//! abort-on-first-failure behavior of a benchmark binary convert the error
//! at the outermost layer.

use crate::types::DeviceId;
use thiserror::Error;

/// Errors produced by accelerator runtime calls.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Fewer accelerators are present than the operation needs.
    ///
    /// Reported before any allocation takes place.
    #[error("need at least {needed} device(s), found {available}")]
    NotEnoughDevices {
        /// Number of devices the operation requires
        needed: usize,
        /// Number of devices the runtime exposes
        available: usize,
    },

    /// Device memory allocation failed.
    #[error("allocation of {bytes} bytes on {device} failed: {reason}")]
    Allocation {
        /// Device the allocation was attempted on
        device: DeviceId,
        /// Requested size in bytes
        bytes: usize,
        /// Underlying error text
        reason: String,
    },

    /// A memory copy failed or was rejected.
    #[error("{direction} copy failed: {reason}")]
    Transfer {
        /// Copy direction, e.g. `"host-to-device"`
        direction: &'static str,
        /// Underlying error text
        reason: String,
    },

    /// A kernel launch failed.
    #[error("launch of kernel `{kernel}` failed: {reason}")]
    Launch {
        /// Kernel name
        kernel: String,
        /// Underlying error text
        reason: String,
    },

    /// Waiting for a queue to drain failed.
    #[error("synchronization on {device} failed: {reason}")]
    Sync {
        /// Device whose queue was being synchronized
        device: DeviceId,
        /// Underlying error text
        reason: String,
    },

    /// Peer access between two devices could not be queried, enabled,
    /// disabled, or used.
    #[error("peer access {from} -> {to}: {reason}")]
    PeerAccess {
        /// Device whose memory is being exposed
        from: DeviceId,
        /// Device gaining (or losing) access
        to: DeviceId,
        /// Underlying error text
        reason: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {parameter} {reason}")]
    InvalidConfig {
        /// Name of the offending parameter
        parameter: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The rank-to-rank transport failed (peer hung up, tag mismatch).
    #[error("transport failure: {reason}")]
    Transport {
        /// Underlying error text
        reason: String,
    },

    /// Runtime initialization failed (driver load, kernel compilation).
    #[error("runtime initialization failed: {reason}")]
    Init {
        /// Underlying error text
        reason: String,
    },
}

impl RuntimeError {
    /// Create a NotEnoughDevices error.
    pub fn not_enough_devices(needed: usize, available: usize) -> Self {
        Self::NotEnoughDevices { needed, available }
    }

    /// Create an Allocation error.
    pub fn allocation<S: Into<String>>(device: DeviceId, bytes: usize, reason: S) -> Self {
        Self::Allocation {
            device,
            bytes,
            reason: reason.into(),
        }
    }

    /// Create a Transfer error for a given copy direction.
    pub fn transfer<S: Into<String>>(direction: &'static str, reason: S) -> Self {
        Self::Transfer {
            direction,
            reason: reason.into(),
        }
    }

    /// Create a Launch error.
    pub fn launch<S1, S2>(kernel: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Launch {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    /// Create a Sync error.
    pub fn sync<S: Into<String>>(device: DeviceId, reason: S) -> Self {
        Self::Sync {
            device,
            reason: reason.into(),
        }
    }

    /// Create a PeerAccess error.
    pub fn peer_access<S: Into<String>>(from: DeviceId, to: DeviceId, reason: S) -> Self {
        Self::PeerAccess {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config<S: Into<String>>(parameter: &'static str, reason: S) -> Self {
        Self::InvalidConfig {
            parameter,
            reason: reason.into(),
        }
    }

    /// Create a Transport error.
    pub fn transport<S: Into<String>>(reason: S) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an Init error.
    pub fn init<S: Into<String>>(reason: S) -> Self {
        Self::Init {
            reason: reason.into(),
        }
    }
}

/// Result type alias for accelerator runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RuntimeError::not_enough_devices(2, 1);
        assert!(matches!(err, RuntimeError::NotEnoughDevices { .. }));
        assert_eq!(err.to_string(), "need at least 2 device(s), found 1");

        let err = RuntimeError::allocation(DeviceId(1), 800, "out of memory");
        assert!(matches!(err, RuntimeError::Allocation { .. }));
        assert_eq!(
            err.to_string(),
            "allocation of 800 bytes on device 1 failed: out of memory"
        );
    }

    #[test]
    fn test_error_display_is_nonempty() {
        let errors = vec![
            RuntimeError::transfer("host-to-device", "source exceeds destination"),
            RuntimeError::launch("vector_add_f64", "invalid grid"),
            RuntimeError::sync(DeviceId(0), "queue poisoned"),
            RuntimeError::peer_access(DeviceId(0), DeviceId(1), "not supported"),
            RuntimeError::invalid_config("devices", "must be at least 1"),
            RuntimeError::transport("peer rank hung up"),
            RuntimeError::init("kernel compilation failed"),
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_peer_access_context() {
        let err = RuntimeError::peer_access(DeviceId(0), DeviceId(1), "already enabled");
        if let RuntimeError::PeerAccess { from, to, reason } = err {
            assert_eq!(from, DeviceId(0));
            assert_eq!(to, DeviceId(1));
            assert_eq!(reason, "already enabled");
        } else {
            panic!("expected PeerAccess variant");
        }
    }
}
