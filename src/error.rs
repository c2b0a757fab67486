//! Error taxonomy shared by capture, sync and transfer components.

use serde::{Deserialize, Serialize};

/// Why a transfer over the peer link failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    /// The channel was never activated on this side
    #[error("session not available")]
    SessionNotAvailable,
    /// The peer cannot currently receive messages (transient)
    #[error("peer not reachable")]
    PeerNotReachable,
    /// A reply-expecting send got no reply in time
    #[error("no reply from peer")]
    ReplyTimeout,
    /// A buffered chunk was re-sent too many times without an ack
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    /// The peer answered with something other than the expected ack
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    /// The transport itself reported an error
    #[error("transport error: {0}")]
    Transport(String),
}

/// Stable error discriminator, carried as `errorType` in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    PermissionDenied,
    BatteryTooLow,
    StorageTooLow,
    ConfigurationFailed,
    RecordingFailed,
    FileSystemError,
    TransferFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permissionDenied",
            ErrorKind::BatteryTooLow => "batteryTooLow",
            ErrorKind::StorageTooLow => "storageTooLow",
            ErrorKind::ConfigurationFailed => "configurationFailed",
            ErrorKind::RecordingFailed => "recordingFailed",
            ErrorKind::FileSystemError => "fileSystemError",
            ErrorKind::TransferFailed => "transferFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("microphone access was denied")]
    PermissionDenied,

    #[error("battery too low to record ({level}%)")]
    BatteryTooLow { level: u8 },

    #[error("not enough free storage to record ({available_mb} MiB available)")]
    StorageTooLow { available_mb: u64 },

    #[error("audio configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("recording failed: {0}")]
    RecordingFailed(String),

    #[error("file system error: {0}")]
    FileSystemError(String),

    #[error("transfer failed: {0}")]
    TransferFailed(TransferFailure),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::PermissionDenied => ErrorKind::PermissionDenied,
            SyncError::BatteryTooLow { .. } => ErrorKind::BatteryTooLow,
            SyncError::StorageTooLow { .. } => ErrorKind::StorageTooLow,
            SyncError::ConfigurationFailed(_) => ErrorKind::ConfigurationFailed,
            SyncError::RecordingFailed(_) => ErrorKind::RecordingFailed,
            SyncError::FileSystemError(_) => ErrorKind::FileSystemError,
            SyncError::TransferFailed(_) => ErrorKind::TransferFailed,
        }
    }

    /// Hint for the user, where one makes sense
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::PermissionDenied => {
                Some("Allow microphone access in the device settings and try again.")
            }
            SyncError::BatteryTooLow { .. } => Some("Charge the device before recording."),
            SyncError::StorageTooLow { .. } => {
                Some("Free up space by syncing or deleting older recordings.")
            }
            SyncError::ConfigurationFailed(_) => {
                Some("Check the audio settings (16-bit PCM, mono or stereo).")
            }
            SyncError::RecordingFailed(_) => Some("Stop and start the recording again."),
            SyncError::FileSystemError(_) => None,
            SyncError::TransferFailed(TransferFailure::SessionNotAvailable) => {
                Some("Open the companion app on both devices.")
            }
            SyncError::TransferFailed(TransferFailure::PeerNotReachable) => {
                Some("Keep the devices close together; data will be sent when they reconnect.")
            }
            SyncError::TransferFailed(_) => None,
        }
    }

    pub fn transfer(failure: TransferFailure) -> Self {
        SyncError::TransferFailed(failure)
    }

    /// The transfer sub-reason, if this is a transfer failure
    pub fn transfer_failure(&self) -> Option<&TransferFailure> {
        match self {
            SyncError::TransferFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return SyncError::FileSystemError(format!("permission denied: {}", err));
        }
        SyncError::FileSystemError(err.to_string())
    }
}

impl From<hound::Error> for SyncError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) => SyncError::from(io),
            hound::Error::Unsupported => {
                SyncError::ConfigurationFailed("unsupported WAV format".to_string())
            }
            other => SyncError::RecordingFailed(other.to_string()),
        }
    }
}

/// Map a backend start error onto the taxonomy.
///
/// Backends may return a `SyncError` wrapped in `anyhow`; anything else is a recorder failure.
pub fn from_backend_error(err: anyhow::Error) -> SyncError {
    match err.downcast::<SyncError>() {
        Ok(sync) => sync,
        Err(other) => SyncError::RecordingFailed(format!("{:#}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_failures_carry_their_sub_reason() {
        let err = SyncError::transfer(TransferFailure::PeerNotReachable);
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert_eq!(err.transfer_failure(), Some(&TransferFailure::PeerNotReachable));
        assert_eq!(err.to_string(), "transfer failed: peer not reachable");
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn transfer_failure_is_a_std_error() {
        let failure = TransferFailure::RetriesExhausted { attempts: 4 };
        let err: anyhow::Error = failure.clone().into();
        assert_eq!(err.to_string(), "gave up after 4 attempts");
        assert_eq!(err.downcast_ref::<TransferFailure>(), Some(&failure));

        let wrapped = SyncError::transfer(TransferFailure::Transport("reset".to_string()));
        assert_eq!(wrapped.to_string(), "transfer failed: transport error: reset");
    }

    #[test]
    fn backend_errors_keep_permission_denied() {
        let err = anyhow::Error::new(SyncError::PermissionDenied).context("starting mic");
        assert_eq!(from_backend_error(err), SyncError::PermissionDenied);

        let err = anyhow::anyhow!("device busy");
        assert!(matches!(from_backend_error(err), SyncError::RecordingFailed(_)));
    }
}
