//! Shared error taxonomy.
//!
//! One closed enum travels across the app IPC, the wire protocol and the
//! worker exit-code boundary, so every surface reports failures in the same
//! vocabulary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Success,
    Unknown,
    InvalidParameter,

    // Admission
    AccessCodeInvalid,
    ServingAnotherClient,
    ClientVersionTooLow,
    HostVersionTooLow,
    AppNotOnline,
    UserReject,

    // Peer handshake
    AuthFailed,
    HostFailed,

    // Worker / controlled side
    ControlledInitFailed,
    WorkerKeepAliveTimeout,
    WorkerInitVideoFailed,
    WorkerInitAudioFailed,
    WorkerInitInputFailed,
    InitDecodeRenderPipelineFailed,

    // Service status
    ServiceStatusDisconnectedFromServer,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

/// Worker child exit codes. Values above 255 (unrepresentable on Unix, where
/// death by signal plays the same role) mean "please restart".
pub const EXIT_CODE_OK: i32 = 0;
pub const EXIT_CODE_TIMEOUT: i32 = 1;
pub const EXIT_CODE_INIT_WORKER_FAILED: i32 = 2;
pub const EXIT_CODE_INIT_VIDEO_FAILED: i32 = 3;
pub const EXIT_CODE_INIT_AUDIO_FAILED: i32 = 4;
pub const EXIT_CODE_INIT_INPUT_FAILED: i32 = 5;
pub const EXIT_CODE_CHANGE_STREAMING_PARAMS_FAILED: i32 = 6;

/// What the supervisor should do with a finished worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exit code 0: the session is over, do not restart.
    Clean,
    /// A defined 1..=255 error. Restarting would only fail again; surface
    /// the code and stop.
    Error(ErrorCode),
    /// Crash or an explicit restart request: relaunch with backoff.
    Restart,
}

/// Map a raw exit code onto the restart policy and error taxonomy.
///
/// `None` stands for death by signal, the portable equivalent of the
/// original's above-255 "please restart" range.
pub fn classify_worker_exit(code: Option<i32>) -> WorkerExit {
    match code {
        None => WorkerExit::Restart,
        Some(EXIT_CODE_OK) => WorkerExit::Clean,
        Some(c) if (1..=255).contains(&c) => WorkerExit::Error(match c {
            EXIT_CODE_TIMEOUT => ErrorCode::WorkerKeepAliveTimeout,
            EXIT_CODE_INIT_WORKER_FAILED => ErrorCode::ControlledInitFailed,
            EXIT_CODE_INIT_VIDEO_FAILED => ErrorCode::WorkerInitVideoFailed,
            EXIT_CODE_INIT_AUDIO_FAILED => ErrorCode::WorkerInitAudioFailed,
            EXIT_CODE_INIT_INPUT_FAILED => ErrorCode::WorkerInitInputFailed,
            EXIT_CODE_CHANGE_STREAMING_PARAMS_FAILED => {
                ErrorCode::InitDecodeRenderPipelineFailed
            }
            _ => ErrorCode::Unknown,
        }),
        Some(_) => WorkerExit::Restart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_never_restarts() {
        assert_eq!(classify_worker_exit(Some(0)), WorkerExit::Clean);
    }

    #[test]
    fn defined_codes_map_to_error_taxonomy() {
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_TIMEOUT)),
            WorkerExit::Error(ErrorCode::WorkerKeepAliveTimeout)
        );
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_INIT_VIDEO_FAILED)),
            WorkerExit::Error(ErrorCode::WorkerInitVideoFailed)
        );
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_INIT_AUDIO_FAILED)),
            WorkerExit::Error(ErrorCode::WorkerInitAudioFailed)
        );
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_INIT_INPUT_FAILED)),
            WorkerExit::Error(ErrorCode::WorkerInitInputFailed)
        );
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_INIT_WORKER_FAILED)),
            WorkerExit::Error(ErrorCode::ControlledInitFailed)
        );
        assert_eq!(
            classify_worker_exit(Some(EXIT_CODE_CHANGE_STREAMING_PARAMS_FAILED)),
            WorkerExit::Error(ErrorCode::InitDecodeRenderPipelineFailed)
        );
    }

    #[test]
    fn undefined_small_codes_are_unknown_errors() {
        assert_eq!(
            classify_worker_exit(Some(99)),
            WorkerExit::Error(ErrorCode::Unknown)
        );
        assert_eq!(
            classify_worker_exit(Some(255)),
            WorkerExit::Error(ErrorCode::Unknown)
        );
    }

    #[test]
    fn above_255_requests_restart() {
        assert_eq!(classify_worker_exit(Some(256)), WorkerExit::Restart);
        assert_eq!(classify_worker_exit(Some(3221225477u32 as i32)), WorkerExit::Restart);
    }

    #[test]
    fn signal_death_requests_restart() {
        assert_eq!(classify_worker_exit(None), WorkerExit::Restart);
    }

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AccessCodeInvalid).unwrap();
        assert_eq!(json, r#""access_code_invalid""#);
        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorCode::AccessCodeInvalid);
    }
}
