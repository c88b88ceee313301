//! The cloud backend boundary.
//!
//! [`AwsCli`] talks to AWS IoT through the `aws` command line client, so the
//! operator's usual AWS configuration (profiles, SSO, environment) applies
//! unchanged.

use std::path::PathBuf;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    error::Stage,
    settings::ThingGroup,
    tools::{InvocationResult, InvokeError, ToolCommand, ToolRunner},
    Settings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// A device as known to the cloud backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloudIdentity {
    pub thing_name: String,
    pub thing_arn: String,
    /// The backend's full description, as returned.
    pub raw_description: String,
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("{operation} was rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    #[error("could not decode the {operation} response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub trait CloudBackend {
    /// Look up a device by the identity token the bootstrap tool reported.
    fn describe_thing(&self, token: &str) -> Result<CloudIdentity, CloudError>;

    /// Make the device a member of `group`. Joining a group the device is
    /// already in is not an error.
    fn add_thing_to_group(
        &self,
        group: &ThingGroup,
        identity: &CloudIdentity,
    ) -> Result<(), CloudError>;

    /// Replace the device shadow with `document`.
    fn update_shadow(&self, identity: &CloudIdentity, document: &str) -> Result<(), CloudError>;
}

/// [`CloudBackend`] over the `aws` command line client.
#[derive(Debug, Clone)]
pub struct AwsCli<R: ToolRunner> {
    runner: R,
    program: PathBuf,
    region: Option<String>,
    profile: Option<String>,
}
impl<R: ToolRunner> AwsCli<R> {
    pub fn new(runner: R, settings: &Settings) -> Self {
        AwsCli {
            runner,
            program: settings.aws_path.clone(),
            region: settings.region.clone(),
            profile: settings.profile.clone(),
        }
    }
}
impl<R: ToolRunner> CloudBackend for AwsCli<R> {
    fn describe_thing(&self, token: &str) -> Result<CloudIdentity, CloudError> {
        const OPERATION: &str = "describe-thing";
        let command = self
            .aws(Stage::Provision, "iot", OPERATION)
            .arg("--thing-name")
            .arg(token);
        let result = accepted(OPERATION, self.runner.invoke(&command)?)?;

        let description: ThingDescription = serde_json::from_str(&result.stdout)
            .map_err(|source| CloudError::Decode {
                operation: OPERATION,
                source,
            })?;
        Ok(CloudIdentity {
            thing_name: description.thing_name,
            thing_arn: description.thing_arn,
            raw_description: result.stdout,
        })
    }

    fn add_thing_to_group(
        &self,
        group: &ThingGroup,
        identity: &CloudIdentity,
    ) -> Result<(), CloudError> {
        const OPERATION: &str = "add-thing-to-thing-group";
        let mut command = self
            .aws(Stage::Register, "iot", OPERATION)
            .arg("--thing-group-name")
            .arg(group.name.as_str());
        if let Some(arn) = &group.arn {
            command = command.arg("--thing-group-arn").arg(arn.as_str());
        }
        let command = command
            .arg("--thing-name")
            .arg(identity.thing_name.as_str())
            .arg("--thing-arn")
            .arg(identity.thing_arn.as_str());

        match accepted(OPERATION, self.runner.invoke(&command)?) {
            Ok(_) => Ok(()),
            Err(CloudError::Rejected { message, .. }) if message.contains("already") => {
                debug!("{} is already in {}", identity.thing_name, group.name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn update_shadow(&self, identity: &CloudIdentity, document: &str) -> Result<(), CloudError> {
        const OPERATION: &str = "update-thing-shadow";
        let command = self
            .aws(Stage::Register, "iot-data", OPERATION)
            .arg("--thing-name")
            .arg(identity.thing_name.as_str())
            .arg("--cli-binary-format")
            .arg("raw-in-base64-out")
            .arg("--payload")
            .arg(document)
            .arg("/dev/stdout");
        let result = accepted(OPERATION, self.runner.invoke(&command)?)?;
        debug!("shadow of {}: {}", identity.thing_name, result.stdout.trim());
        Ok(())
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThingDescription {
    thing_name: String,
    thing_arn: String,
}

impl<R: ToolRunner> AwsCli<R> {
    fn aws(&self, stage: Stage, service: &str, operation: &str) -> ToolCommand {
        let mut command = ToolCommand::new(stage, &self.program)
            .arg(service)
            .arg(operation)
            .arg("--output")
            .arg("json");
        if let Some(region) = &self.region {
            command = command.arg("--region").arg(region.as_str());
        }
        if let Some(profile) = &self.profile {
            command = command.arg("--profile").arg(profile.as_str());
        }
        command
    }
}

/// Unlike `mos`, the `aws` client reports through its exit status.
fn accepted(
    operation: &'static str,
    result: InvocationResult,
) -> Result<InvocationResult, CloudError> {
    if result.succeeded() {
        Ok(result)
    } else {
        Err(CloudError::Rejected {
            operation,
            message: result.stderr.trim().to_owned(),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
struct Replay {
    result: InvocationResult,
    seen: std::cell::RefCell<Vec<ToolCommand>>,
}
#[cfg(test)]
impl Replay {
    fn new(status: i32, stdout: &str, stderr: &str) -> Self {
        Replay {
            result: InvocationResult::new(Some(status), stdout, stderr),
            seen: std::cell::RefCell::new(Vec::new()),
        }
    }
}
#[cfg(test)]
impl ToolRunner for Replay {
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError> {
        self.seen.borrow_mut().push(command.clone());
        Ok(self.result.clone())
    }
}

#[cfg(test)]
fn identity() -> CloudIdentity {
    CloudIdentity {
        thing_name: "esp32_0A1B2C".into(),
        thing_arn: "arn:aws:iot:us-east-1:123456789012:thing/esp32_0A1B2C".into(),
        raw_description: String::new(),
    }
}

#[test]
fn describes_thing() {
    let stdout = r#"{
        "defaultClientId": "esp32_0A1B2C",
        "thingName": "esp32_0A1B2C",
        "thingId": "0f8a",
        "thingArn": "arn:aws:iot:us-east-1:123456789012:thing/esp32_0A1B2C",
        "attributes": {},
        "version": 1
    }"#;
    let replay = Replay::new(0, stdout, "");
    let settings = crate::SettingsBuilder::new().region("us-east-1").finalize();
    let backend = AwsCli::new(&replay, &settings);

    let found = backend.describe_thing("esp32_0A1B2C").unwrap();
    assert_eq!(found.thing_name, "esp32_0A1B2C");
    assert_eq!(found.thing_arn, identity().thing_arn);
    assert_eq!(found.raw_description, stdout);

    let seen = replay.seen.borrow();
    assert_eq!(
        seen[0].to_string(),
        "aws iot describe-thing --output json --region us-east-1 --thing-name esp32_0A1B2C"
    );
}

#[test]
fn garbage_description_is_a_decode_error() {
    let replay = Replay::new(0, "not json", "");
    let backend = AwsCli::new(&replay, &crate::SettingsBuilder::new().finalize());
    assert!(matches!(
        backend.describe_thing("esp32_0A1B2C"),
        Err(CloudError::Decode { .. })
    ));
}

#[test]
fn rejected_call_reports_stderr() {
    let replay = Replay::new(
        254,
        "",
        "An error occurred (ResourceNotFoundException) when calling the DescribeThing operation\n",
    );
    let backend = AwsCli::new(&replay, &crate::SettingsBuilder::new().finalize());
    match backend.describe_thing("esp32_0A1B2C") {
        Err(CloudError::Rejected { operation, message }) => {
            assert_eq!(operation, "describe-thing");
            assert!(message.contains("ResourceNotFoundException"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn joining_a_group_twice_is_fine() {
    let replay = Replay::new(255, "", "thing is already a member of the group\n");
    let settings = crate::SettingsBuilder::new()
        .thing_group("BX1-Things", Some("arn:aws:iot:us-east-1:1:thinggroup/BX1-Things".into()))
        .finalize();
    let backend = AwsCli::new(&replay, &settings);
    backend
        .add_thing_to_group(&settings.thing_group, &identity())
        .unwrap();
    let shown = replay.seen.borrow()[0].to_string();
    assert!(shown.contains("--thing-group-name BX1-Things"));
    assert!(shown.contains("--thing-group-arn arn:aws:iot:us-east-1:1:thinggroup/BX1-Things"));
}

#[test]
fn shadow_payload_is_sent_raw() {
    let replay = Replay::new(0, "{\"state\":{}}", "");
    let settings = crate::SettingsBuilder::new().finalize();
    let backend = AwsCli::new(&replay, &settings);
    backend
        .update_shadow(&identity(), &settings.shadow_document)
        .unwrap();
    let seen = replay.seen.borrow();
    let args = seen[0].args();
    let payload = args.iter().position(|a| a == "--payload").unwrap();
    assert_eq!(args[payload + 1], r#"{"state":{"desired":{"state":"ready"}}}"#);
    assert_eq!(seen[0].stage(), Stage::Register);
}
