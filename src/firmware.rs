//! The `mos` driven stages: build, flash and wifi.
//!
//! Every stage runs one `mos` subcommand in the firmware repository and lets
//! the classifier decide how it went.

use std::path::PathBuf;

use log::{debug, info};

use crate::{
    error::{Stage, StageError},
    tools::{require_success, ToolCommand, ToolRunner, BUILD_MARKERS, FLASH_MARKERS, WIFI_MARKERS},
    utils::DeviceHandle,
    Settings,
};

/// The firmware image the flash stage will use.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BuildOutcome {
    /// A previous build was reused.
    Cached(PathBuf),
    /// The firmware was rebuilt during this run.
    Built(PathBuf),
}

/// Build the firmware unless the previous artifact is still good.
///
/// The artifact is reused only when no rebuild is required **and** it exists.
/// A build whose output does not say it succeeded, or that leaves no artifact
/// behind, is an error: flashing a stale image is not an option.
pub fn build_firmware(
    runner: &dyn ToolRunner,
    settings: &Settings,
    rebuild_required: bool,
) -> Result<BuildOutcome, StageError> {
    let artifact = settings.artifact_path();
    if !rebuild_required && artifact.is_file() {
        debug!("reusing {}", artifact.display());
        return Ok(BuildOutcome::Cached(artifact));
    }

    let command = mos(settings, Stage::Build)
        .arg("build")
        .arg("--arch")
        .arg(settings.arch.as_str());
    let result = runner.invoke(&command)?;
    require_success(&result, &BUILD_MARKERS)?;

    if !artifact.is_file() {
        return Err(StageError::Fatal {
            stage: Stage::Build,
            reason: format!("build reported success but {} is missing", artifact.display()),
        });
    }
    info!("firmware built at {}", artifact.display());
    Ok(BuildOutcome::Built(artifact))
}

/// Flash the firmware onto the device.
pub fn flash_device(
    runner: &dyn ToolRunner,
    settings: &Settings,
    device: &DeviceHandle,
) -> Result<(), StageError> {
    let command = mos(settings, Stage::Flash)
        .arg("flash")
        .arg("--port")
        .arg(device.path());
    let result = runner.invoke(&command)?;
    require_success(&result, &FLASH_MARKERS)?;
    Ok(())
}

/// Hand the wireless credentials to the device.
pub fn join_wifi(
    runner: &dyn ToolRunner,
    settings: &Settings,
    device: &DeviceHandle,
) -> Result<(), StageError> {
    let command = mos(settings, Stage::Wifi)
        .arg("wifi")
        .arg(settings.wifi.ssid.as_str())
        .secret_arg(settings.wifi.passphrase.as_str())
        .arg("--port")
        .arg(device.path());
    let result = runner.invoke(&command)?;
    require_success(&result, &WIFI_MARKERS)?;
    Ok(())
}

/// A `mos` invocation rooted in the firmware repository.
pub(crate) fn mos(settings: &Settings, stage: Stage) -> ToolCommand {
    ToolCommand::new(stage, &settings.mos_path).current_dir(&settings.repo_path)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
use crate::tools::{InvocationResult, InvokeError};

#[cfg(test)]
struct OneShot {
    stderr: &'static str,
    seen: std::cell::RefCell<Vec<ToolCommand>>,
}
#[cfg(test)]
impl OneShot {
    fn new(stderr: &'static str) -> Self {
        OneShot {
            stderr,
            seen: std::cell::RefCell::new(Vec::new()),
        }
    }
}
#[cfg(test)]
impl ToolRunner for OneShot {
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError> {
        self.seen.borrow_mut().push(command.clone());
        Ok(InvocationResult::new(Some(0), "", self.stderr))
    }
}

#[cfg(test)]
fn repo_with_artifact(present: bool) -> (tempfile::TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    if present {
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build").join("fw.zip"), b"PK").unwrap();
    }
    let settings = crate::SettingsBuilder::new()
        .repo_path(dir.path())
        .wifi("workshop", "hunter2")
        .finalize();
    (dir, settings)
}

#[test]
fn cached_artifact_skips_the_build() {
    let (_dir, settings) = repo_with_artifact(true);
    let runner = OneShot::new("");
    let outcome = build_firmware(&runner, &settings, false).unwrap();
    assert_eq!(outcome, BuildOutcome::Cached(settings.artifact_path()));
    assert!(runner.seen.borrow().is_empty());
}

#[test]
fn rebuild_runs_mos_build() {
    let (_dir, settings) = repo_with_artifact(true);
    let runner = OneShot::new("Success, built BX1/esp32 version 1.0\n");
    let outcome = build_firmware(&runner, &settings, true).unwrap();
    assert_eq!(outcome, BuildOutcome::Built(settings.artifact_path()));
    let seen = runner.seen.borrow();
    assert_eq!(seen[0].args(), ["build", "--arch", "esp32"]);
    assert_eq!(seen[0].cwd(), Some(settings.repo_path.as_path()));
}

#[test]
fn missing_artifact_forces_a_build() {
    let (_dir, settings) = repo_with_artifact(false);
    let runner = OneShot::new("...done.\n");
    match build_firmware(&runner, &settings, false) {
        Err(StageError::Unrecognized { stage, .. }) => assert_eq!(stage, Stage::Build),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(runner.seen.borrow().len(), 1);
}

#[test]
fn successful_build_without_artifact_is_fatal() {
    let (_dir, settings) = repo_with_artifact(false);
    let runner = OneShot::new("Success, built BX1/esp32\n");
    assert!(matches!(
        build_firmware(&runner, &settings, true),
        Err(StageError::Fatal {
            stage: Stage::Build,
            ..
        })
    ));
}

#[test]
fn flash_targets_the_device() {
    let (_dir, settings) = repo_with_artifact(true);
    let device = DeviceHandle::from(crate::utils::DeviceCandidate {
        path: "/dev/ttyUSB0".into(),
    });
    let runner = OneShot::new("Writing...\nAll done!\n");
    flash_device(&runner, &settings, &device).unwrap();
    assert_eq!(
        runner.seen.borrow()[0].args(),
        ["flash", "--port", "/dev/ttyUSB0"]
    );

    let failing = OneShot::new("Error: previous firmware\n");
    assert!(matches!(
        flash_device(&failing, &settings, &device),
        Err(StageError::Fatal {
            stage: Stage::Flash,
            ..
        })
    ));
}

#[test]
fn wifi_passes_credentials() {
    let (_dir, settings) = repo_with_artifact(true);
    let device = DeviceHandle::from(crate::utils::DeviceCandidate {
        path: "/dev/ttyUSB0".into(),
    });
    let runner = OneShot::new("Saving and rebooting...\n");
    join_wifi(&runner, &settings, &device).unwrap();
    let seen = runner.seen.borrow();
    assert_eq!(
        seen[0].args(),
        ["wifi", "workshop", "hunter2", "--port", "/dev/ttyUSB0"]
    );
    assert!(!seen[0].to_string().contains("hunter2"));
}
