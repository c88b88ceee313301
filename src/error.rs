//! Error taxonomy of a provisioning run.
//!
//! Each component reports its own error type. Everything that can stop the
//! pipeline is folded into [`PipelineError`], which is the only error the
//! driver sees and the only place where exit codes are decided.

use std::{fmt, io};

use thiserror::Error;

use crate::{
    cloud::ProvisionError,
    tools::InvokeError,
    utils::{DiscoveryError, SelectionError},
};

/// The pipeline stages that wrap an external tool.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stage {
    Build,
    Flash,
    Provision,
    Register,
    Wifi,
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Flash => "flash",
            Stage::Provision => "cloud provisioning",
            Stage::Register => "cloud registration",
            Stage::Wifi => "wifi setup",
        };
        f.write_str(name)
    }
}

/// Failure of a single tool-backed stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("{stage} failed: {reason}")]
    Fatal { stage: Stage, reason: String },

    #[error("{stage} produced output with no known status marker")]
    Unrecognized { stage: Stage, output: String },
}

/// Everything that stops a provisioning run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not start `{program}`: {message}")]
    Launch { program: String, message: String },

    #[error("{stage} failed: {reason}")]
    Fatal { stage: Stage, reason: String },

    #[error("{stage} produced output with no known status marker")]
    Unrecognized { stage: Stage, output: String },

    #[error("no device found, make sure your device is connected")]
    NoDeviceFound,

    #[error(transparent)]
    Selection(SelectionError),

    #[error("interrupted by the operator")]
    Interrupted,
}
impl PipelineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::NoDeviceFound => 2,
            PipelineError::Interrupted => 130,
            _ => 1,
        }
    }

    /// The stage this error was raised by, when it was raised by a stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Fatal { stage, .. } | PipelineError::Unrecognized { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }

    /// What the operator should do about it, if anything useful can be said.
    pub fn operator_hint(&self) -> Option<&'static str> {
        match self {
            PipelineError::Fatal {
                stage: Stage::Flash,
                ..
            }
            | PipelineError::Unrecognized {
                stage: Stage::Flash,
                ..
            } => Some("Previous firmware found? Disconnect the device and retry."),
            PipelineError::NoDeviceFound => Some("Connect the device and run again."),
            PipelineError::Fatal {
                stage: Stage::Build,
                ..
            }
            | PipelineError::Unrecognized {
                stage: Stage::Build,
                ..
            } => Some("The device was not touched. Fix the build and run again."),
            _ => None,
        }
    }
}

impl From<StageError> for PipelineError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Invoke(err) => err.into(),
            StageError::Fatal { stage, reason } => PipelineError::Fatal { stage, reason },
            StageError::Unrecognized { stage, output } => {
                PipelineError::Unrecognized { stage, output }
            }
        }
    }
}

impl From<InvokeError> for PipelineError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Launch {
                program, source, ..
            } => PipelineError::Launch {
                program,
                message: source.to_string(),
            },
            InvokeError::Interrupted { .. } => PipelineError::Interrupted,
            err @ InvokeError::Timeout { .. } | err @ InvokeError::Io { .. } => {
                PipelineError::Fatal {
                    stage: err.stage(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

impl From<DiscoveryError> for PipelineError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::NoDeviceFound => PipelineError::NoDeviceFound,
            DiscoveryError::Selection(err) => err.into(),
        }
    }
}

impl From<SelectionError> for PipelineError {
    fn from(err: SelectionError) -> Self {
        match err {
            // Ctrl+C at the prompt.
            SelectionError::Prompt(e) if e.kind() == io::ErrorKind::Interrupted => {
                PipelineError::Interrupted
            }
            err => PipelineError::Selection(err),
        }
    }
}

impl From<ProvisionError> for PipelineError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Stage(err) => err.into(),
            ProvisionError::Cloud(crate::cloud::CloudError::Invoke(err)) => err.into(),
            other => PipelineError::Fatal {
                stage: Stage::Provision,
                reason: other.to_string(),
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn exit_codes() {
    assert_eq!(PipelineError::NoDeviceFound.exit_code(), 2);
    assert_eq!(PipelineError::Interrupted.exit_code(), 130);
    let fatal = PipelineError::Fatal {
        stage: Stage::Flash,
        reason: "Error: boom".into(),
    };
    assert_eq!(fatal.exit_code(), 1);
    assert_eq!(fatal.stage(), Some(Stage::Flash));
}

#[test]
fn flash_failures_ask_for_disconnect() {
    let unrecognized = PipelineError::Unrecognized {
        stage: Stage::Flash,
        output: String::new(),
    };
    assert!(unrecognized.operator_hint().unwrap().contains("Disconnect"));
}

#[test]
fn timeout_is_fatal() {
    let err: PipelineError = InvokeError::Timeout {
        stage: Stage::Wifi,
        command: "mos wifi".into(),
        timeout: std::time::Duration::from_secs(1),
    }
    .into();
    assert!(matches!(
        err,
        PipelineError::Fatal {
            stage: Stage::Wifi,
            ..
        }
    ));
}

#[test]
fn interrupted_prompt_is_an_interrupt() {
    let err: PipelineError = DiscoveryError::Selection(SelectionError::Prompt(
        io::Error::new(io::ErrorKind::Interrupted, "read interrupted"),
    ))
    .into();
    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(err.exit_code(), 130);

    let err: PipelineError = SelectionError::Prompt(io::ErrorKind::UnexpectedEof.into()).into();
    assert!(matches!(err, PipelineError::Selection(_)));
    assert_eq!(err.exit_code(), 1);
}
