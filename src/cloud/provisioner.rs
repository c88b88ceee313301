//! Bootstraps the device against AWS IoT with `mos aws-iot-setup`, then looks
//! up the identity it was registered under.
//!
//! `aws-iot-setup` finishes by writing the device configuration and echoes
//! the values it set, one `key = value` per line, on its error stream:
//!
//! ```text
//! Updating config:
//!   aws.mqtt.server = a1b2c3-ats.iot.us-east-1.amazonaws.com:8883
//!   aws.thing_name = esp32_0A1B2C
//! Saving and rebooting...
//! ```
//!
//! The identity token is the value of the `aws.thing_name` line, matched with
//! an anchored pattern rather than by position.

use log::info;
use regex::Regex;
use thiserror::Error;

use crate::{
    error::{Stage, StageError},
    firmware::mos,
    tools::{require_success, InvocationResult, ToolRunner, PROVISION_MARKERS},
    utils::DeviceHandle,
    Settings,
};

use super::{CloudBackend, CloudError, CloudIdentity};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("invalid identity pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("the setup output does not name the device identity")]
    MissingIdentity,

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Pull the identity token out of a bootstrap run.
///
/// The error stream is searched first, then the output stream. The token is
/// the first capture group of `pattern`.
pub fn extract_identity_token(result: &InvocationResult, pattern: &Regex) -> Option<String> {
    [&result.stderr, &result.stdout]
        .iter()
        .filter_map(|text| pattern.captures(text))
        .filter_map(|captures| captures.get(1))
        .map(|token| token.as_str().to_owned())
        .next()
}

/// Register the device with the cloud and return the identity it got.
pub fn provision_device(
    runner: &dyn ToolRunner,
    backend: &dyn CloudBackend,
    settings: &Settings,
    device: &DeviceHandle,
) -> Result<CloudIdentity, ProvisionError> {
    let pattern = Regex::new(&settings.identity_pattern)?;

    let command = mos(settings, Stage::Provision)
        .arg("aws-iot-setup")
        .arg("--port")
        .arg(device.path());
    let result = runner.invoke(&command).map_err(StageError::from)?;
    require_success(&result, &PROVISION_MARKERS)?;

    let token =
        extract_identity_token(&result, &pattern).ok_or(ProvisionError::MissingIdentity)?;
    info!("device registered as `{}`", token);

    Ok(backend.describe_thing(&token)?)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
const SETUP_OUTPUT: &str = "\
Using port /dev/ttyUSB0
Generating certificate request, type: ECDSA
AWS region: us-east-1
Creating certificate...
Attaching policy \"mos-default\" to the certificate...
Updating config:
  aws.mqtt.server = a1b2c3-ats.iot.us-east-1.amazonaws.com:8883
  aws.thing_name = esp32_0A1B2C
Saving and rebooting...
";

#[cfg(test)]
fn default_pattern() -> Regex {
    Regex::new(crate::settings::DEFAULT_IDENTITY_PATTERN).unwrap()
}

#[test]
fn token_from_labeled_line() {
    let result = InvocationResult::new(Some(0), "", SETUP_OUTPUT);
    assert_eq!(
        extract_identity_token(&result, &default_pattern()),
        Some("esp32_0A1B2C".into())
    );
}

#[test]
fn token_with_windows_line_endings() {
    let stderr = SETUP_OUTPUT.replace('\n', "\r\n");
    let result = InvocationResult::new(Some(0), "", &stderr);
    assert_eq!(
        extract_identity_token(&result, &default_pattern()),
        Some("esp32_0A1B2C".into())
    );
}

#[test]
fn similar_labels_do_not_match() {
    let stderr = "  aws.thing_name_prefix = esp32\n  not.aws.thing_name = x\nSaving and rebooting...\n";
    let result = InvocationResult::new(Some(0), "", stderr);
    assert_eq!(extract_identity_token(&result, &default_pattern()), None);
}

#[test]
fn token_on_output_stream() {
    let result = InvocationResult::new(Some(0), SETUP_OUTPUT, "");
    assert_eq!(
        extract_identity_token(&result, &default_pattern()),
        Some("esp32_0A1B2C".into())
    );
}
