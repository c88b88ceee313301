//! Classification of tool output by status markers.
//!
//! The `mos` tool has no structured exit protocol. Its progress and status
//! text goes to the **error stream**, successful runs included, and the only
//! reliable signal is the presence of a few fixed substrings. All of those
//! substrings live in the marker tables below; stages never look at tool
//! output themselves.
//!
//! Matching rules:
//!
//!  * the error stream is scanned first, the output stream only if nothing
//!    matched in the error stream,
//!  * within a stream, rules are tried in table order and the first rule whose
//!    marker occurs anywhere in the text wins,
//!  * nothing matched means [`Outcome::Unrecognized`], which stages treat as a
//!    failure.
//!
//! Failure markers are listed first in every table so they take precedence
//! over a success marker printed earlier in the same run.

use crate::error::{Stage, StageError};

use super::InvocationResult;

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutcomeKind {
    Success,
    FatalError,
}

/// A substring whose presence stands for a status.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Marker {
    pub text: &'static str,
    pub kind: OutcomeKind,
}

/// The ordered marker rules of one stage.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MarkerTable {
    pub stage: Stage,
    /// Bumped whenever the markers change to follow a new `mos` release.
    pub version: u32,
    pub rules: &'static [Marker],
}

const ERROR_MARKER: Marker = Marker {
    text: "Error:",
    kind: OutcomeKind::FatalError,
};

pub const BUILD_MARKERS: MarkerTable = MarkerTable {
    stage: Stage::Build,
    version: 1,
    rules: &[
        ERROR_MARKER,
        Marker {
            text: "Success, built",
            kind: OutcomeKind::Success,
        },
    ],
};

pub const FLASH_MARKERS: MarkerTable = MarkerTable {
    stage: Stage::Flash,
    version: 1,
    rules: &[
        ERROR_MARKER,
        Marker {
            text: "All done!",
            kind: OutcomeKind::Success,
        },
    ],
};

pub const PROVISION_MARKERS: MarkerTable = MarkerTable {
    stage: Stage::Provision,
    version: 1,
    rules: &[
        ERROR_MARKER,
        Marker {
            text: "Saving and rebooting...",
            kind: OutcomeKind::Success,
        },
    ],
};

pub const WIFI_MARKERS: MarkerTable = MarkerTable {
    stage: Stage::Wifi,
    version: 1,
    rules: &[
        ERROR_MARKER,
        Marker {
            text: "Saving and rebooting...",
            kind: OutcomeKind::Success,
        },
    ],
};

/// The classification of one tool run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// Holds the marker that matched.
    Success(String),
    /// Holds the full line carrying the failure marker.
    FatalError(String),
    /// Holds the raw text that was scanned.
    Unrecognized(String),
}
impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Classify a tool run against a marker table.
pub fn classify(result: &InvocationResult, table: &MarkerTable) -> Outcome {
    for text in [&result.stderr, &result.stdout].iter() {
        if let Some(outcome) = scan(text, table) {
            return outcome;
        }
    }

    let raw = if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    };
    Outcome::Unrecognized(raw.clone())
}

/// Classify and turn anything but a success into the stage's error.
///
/// Returns the matched success marker.
pub fn require_success(
    result: &InvocationResult,
    table: &MarkerTable,
) -> Result<String, StageError> {
    match classify(result, table) {
        Outcome::Success(detail) => Ok(detail),
        Outcome::FatalError(reason) => Err(StageError::Fatal {
            stage: table.stage,
            reason,
        }),
        Outcome::Unrecognized(output) => Err(StageError::Unrecognized {
            stage: table.stage,
            output,
        }),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn scan(text: &str, table: &MarkerTable) -> Option<Outcome> {
    let rule = table.rules.iter().find(|rule| text.contains(rule.text))?;
    Some(match rule.kind {
        OutcomeKind::Success => Outcome::Success(rule.text.to_owned()),
        OutcomeKind::FatalError => {
            let line = text
                .lines()
                .find(|line| line.contains(rule.text))
                .unwrap_or(rule.text);
            Outcome::FatalError(line.trim().to_owned())
        }
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn run(stdout: &str, stderr: &str) -> InvocationResult {
    InvocationResult::new(Some(0), stdout, stderr)
}

#[test]
fn success_marker_on_error_stream() {
    let result = run("", "Connecting...\nWriting flash\nAll done!\n");
    assert_eq!(
        classify(&result, &FLASH_MARKERS),
        Outcome::Success("All done!".into())
    );
}

#[test]
fn failure_marker_takes_precedence() {
    for table in [BUILD_MARKERS, FLASH_MARKERS, PROVISION_MARKERS, WIFI_MARKERS].iter() {
        let success = table
            .rules
            .iter()
            .find(|rule| rule.kind == OutcomeKind::Success)
            .unwrap();
        let stderr = format!("{}\nError: device busy\n", success.text);
        assert_eq!(
            classify(&run("", &stderr), table),
            Outcome::FatalError("Error: device busy".into()),
            "stage {}",
            table.stage
        );
    }
}

#[test]
fn no_marker_is_unrecognized() {
    let result = run("", "Flashing done, probably\n");
    assert_eq!(
        classify(&result, &FLASH_MARKERS),
        Outcome::Unrecognized("Flashing done, probably\n".into())
    );
}

#[test]
fn empty_error_stream_reports_output_stream() {
    let result = run("...done.\n", "");
    assert_eq!(
        classify(&result, &BUILD_MARKERS),
        Outcome::Unrecognized("...done.\n".into())
    );
}

#[test]
fn error_stream_wins_over_output_stream() {
    let result = run("Error: only a log line\n", "Saving and rebooting...\n");
    assert!(classify(&result, &WIFI_MARKERS).is_success());
}

#[test]
fn output_stream_is_scanned_when_error_stream_is_silent() {
    let result = run("Success, built BX1/esp32 version 1.0\n", "");
    assert!(classify(&result, &BUILD_MARKERS).is_success());
}

#[test]
fn exit_status_does_not_override_markers() {
    let result = InvocationResult::new(Some(1), "", "All done!\n");
    assert!(classify(&result, &FLASH_MARKERS).is_success());
}

#[test]
fn require_success_maps_outcomes() {
    assert_eq!(
        require_success(&run("", "Saving and rebooting...\n"), &PROVISION_MARKERS).unwrap(),
        "Saving and rebooting..."
    );
    match require_success(&run("", "nothing useful"), &WIFI_MARKERS) {
        Err(StageError::Unrecognized { stage, .. }) => assert_eq!(stage, Stage::Wifi),
        other => panic!("unexpected {:?}", other),
    }
    match require_success(&run("", "  Error: no port\n"), &FLASH_MARKERS) {
        Err(StageError::Fatal { stage, reason }) => {
            assert_eq!(stage, Stage::Flash);
            assert_eq!(reason, "Error: no port");
        }
        other => panic!("unexpected {:?}", other),
    }
}
