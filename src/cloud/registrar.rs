//! Registers a provisioned device: group membership and initial shadow.
//!
//! Both steps are attempted independently and neither stops the run. What
//! failed is reported so the operator can finish the job from the console.

use log::{info, warn};

use crate::Settings;

use super::{CloudBackend, CloudError, CloudIdentity};

/// Result of the two registration side effects.
#[derive(Debug)]
pub struct RegistrationReport {
    pub grouped: Result<(), CloudError>,
    pub shadow: Result<(), CloudError>,
}
impl RegistrationReport {
    pub fn is_complete(&self) -> bool {
        self.grouped.is_ok() && self.shadow.is_ok()
    }
}

pub fn register_device(
    backend: &dyn CloudBackend,
    settings: &Settings,
    identity: &CloudIdentity,
) -> RegistrationReport {
    let grouped = backend.add_thing_to_group(&settings.thing_group, identity);
    match &grouped {
        Ok(()) => info!(
            "{} joined thing group {}",
            identity.thing_name, settings.thing_group.name
        ),
        Err(e) => warn!("{} not added to {}: {}", identity.thing_name, settings.thing_group.name, e),
    }

    let shadow = backend.update_shadow(identity, &settings.shadow_document);
    match &shadow {
        Ok(()) => info!("shadow of {} initialized", identity.thing_name),
        Err(e) => warn!("shadow of {} not initialized: {}", identity.thing_name, e),
    }

    RegistrationReport { grouped, shadow }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
struct FlakyBackend {
    group_fails: bool,
    calls: std::cell::RefCell<Vec<String>>,
}
#[cfg(test)]
impl CloudBackend for FlakyBackend {
    fn describe_thing(&self, _: &str) -> Result<CloudIdentity, CloudError> {
        unreachable!("registration never describes")
    }

    fn add_thing_to_group(
        &self,
        group: &crate::settings::ThingGroup,
        _: &CloudIdentity,
    ) -> Result<(), CloudError> {
        self.calls.borrow_mut().push(format!("group {}", group.name));
        if self.group_fails {
            Err(CloudError::Rejected {
                operation: "add-thing-to-thing-group",
                message: "AccessDeniedException".into(),
            })
        } else {
            Ok(())
        }
    }

    fn update_shadow(&self, identity: &CloudIdentity, document: &str) -> Result<(), CloudError> {
        self.calls
            .borrow_mut()
            .push(format!("shadow {} {}", identity.thing_name, document));
        Ok(())
    }
}

#[cfg(test)]
fn identity() -> CloudIdentity {
    CloudIdentity {
        thing_name: "esp32_0A1B2C".into(),
        thing_arn: "arn:aws:iot:us-east-1:123456789012:thing/esp32_0A1B2C".into(),
        raw_description: "{}".into(),
    }
}

#[test]
fn both_steps_run() {
    let backend = FlakyBackend {
        group_fails: false,
        calls: Default::default(),
    };
    let settings = crate::SettingsBuilder::new().finalize();
    let report = register_device(&backend, &settings, &identity());
    assert!(report.is_complete());
    assert_eq!(
        *backend.calls.borrow(),
        vec![
            "group BX1-Things".to_string(),
            r#"shadow esp32_0A1B2C {"state":{"desired":{"state":"ready"}}}"#.to_string(),
        ]
    );
}

#[test]
fn group_failure_does_not_skip_the_shadow() {
    let backend = FlakyBackend {
        group_fails: true,
        calls: Default::default(),
    };
    let settings = crate::SettingsBuilder::new().finalize();
    let report = register_device(&backend, &settings, &identity());
    assert!(!report.is_complete());
    assert!(report.grouped.is_err());
    assert!(report.shadow.is_ok());
    assert_eq!(backend.calls.borrow().len(), 2);
}
