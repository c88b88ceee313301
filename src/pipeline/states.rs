//! States for the provisioning pipeline state machine.
//!
//! This modules is private and restricted to the [`pipeline`](crate::pipeline)
//! scope. The public interface of the state machine is provided by
//! [`pipeline`](crate::pipeline).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use log::{info, warn};

use crate::{
    cloud::{provision_device, register_device, CloudIdentity},
    error::PipelineError,
    firmware::{build_firmware, flash_device, join_wifi, BuildOutcome},
    repo::{sync_repository, SyncOutcome},
    utils::{select_device, term, DeviceHandle},
};

use super::context::Context;
use super::events::*;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state does its stage of the work and when
    /// finished, requests transition to a new state by returning the
    /// appropriate `event`. The `event` is then consumed to create the new
    /// `state` using the corresponding `From` trait implementation.
    fn run(&mut self, ctx: &mut Context) -> Event;
}

// Init State ==================================================================

/// Represents the initial state of the pipeline.
///
/// Loads the persisted session, then moves on to the repository check with a
/// **`SyncEvent` => `SyncState`** transition.
#[derive(Debug)]
pub(crate) struct InitState {}
impl Runnable for InitState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Init");
        ctx.session = ctx.store.load();
        info!(
            "session {}: last synchronized on {}",
            ctx.store.path().display(),
            ctx.session.last_sync_date
        );
        Event::Sync(SyncEvent {})
    }
}

// SyncState ===================================================================

/// Pulls the firmware sources, at most once per day.
///
/// A failed pull is reported and the run goes on with the local working copy.
/// Always fires **`BuildEvent` => `BuildState`**.
#[derive(Debug)]
pub(crate) struct SyncState {}
impl Runnable for SyncState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Sync");
        term::heading("Firmware Repository Check");

        let today = ctx.today();
        let outcome = sync_repository(&*ctx.toolbox.upstream, &mut ctx.session, today);
        match &outcome {
            SyncOutcome::Current => term::good("Repository already checked today."),
            SyncOutcome::Updated => term::good("Repository updated."),
            SyncOutcome::Stale(err) => {
                term::warning(&format!("Repository not updated: {}", err));
                term::warning("Continuing with the local copy.");
            }
        }
        Event::Build(BuildEvent {
            rebuild_required: outcome.rebuild_required(),
        })
    }
}

// BuildState ==================================================================

/// Makes sure a firmware image is available.
///
/// From the `BuildState`, the state machine can evolve via the following
/// transitions:
///
///  * **`FindDeviceEvent` => `FindDeviceState`** when an image is available,
///  * **`DoneEvent` => `DoneState`** when the build did not succeed. The device
///    is never touched in that case.
#[derive(Debug)]
pub(crate) struct BuildState {
    pub rebuild_required: bool,
}
impl Runnable for BuildState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Build (rebuild required: {})", self.rebuild_required);
        term::heading("Building from Repository");

        match build_firmware(&*ctx.toolbox.runner, &ctx.settings, self.rebuild_required) {
            Ok(BuildOutcome::Cached(path)) => {
                term::good(&format!("Up-to-date build found at {}.", path.display()));
                Event::FindDevice(FindDeviceEvent {})
            }
            Ok(BuildOutcome::Built(path)) => {
                term::good(&format!("Build updated at {}.", path.display()));
                Event::FindDevice(FindDeviceEvent {})
            }
            Err(err) => Event::failed(err),
        }
    }
}

// FindDeviceState =============================================================

/// Settles on exactly one serial device, asking the operator when several are
/// connected.
#[derive(Debug)]
pub(crate) struct FindDeviceState {}
impl Runnable for FindDeviceState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> FindDevice");
        term::heading("Finding Devices");

        let toolbox = &mut ctx.toolbox;
        match select_device(&*toolbox.prober, &mut *toolbox.operator) {
            Ok(device) => {
                term::good(&format!("Using device at {}", device));
                Event::Flash(FlashEvent { device })
            }
            // The handler may have raised the flag while the prompt failed otherwise.
            Err(_) if ctx.interrupted() => Event::failed(PipelineError::Interrupted),
            Err(err) => Event::failed(err),
        }
    }
}

// FlashState ==================================================================

#[derive(Debug)]
pub(crate) struct FlashState {
    pub device: DeviceHandle,
}
impl Runnable for FlashState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Flash {}", self.device);
        term::heading("Flashing Device");

        match flash_device(&*ctx.toolbox.runner, &ctx.settings, &self.device) {
            Ok(()) => {
                term::good("Flashed successfully.");
                Event::Provision(ProvisionEvent {
                    device: self.device.clone(),
                })
            }
            Err(err) => Event::failed(err),
        }
    }
}

// ProvisionState ==============================================================

/// Bootstraps the device against the cloud and resolves its identity.
#[derive(Debug)]
pub(crate) struct ProvisionState {
    pub device: DeviceHandle,
}
impl Runnable for ProvisionState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Provision {}", self.device);
        term::heading("Provisioning Device with AWS");

        let toolbox = &ctx.toolbox;
        match provision_device(
            &*toolbox.runner,
            &*toolbox.backend,
            &ctx.settings,
            &self.device,
        ) {
            Ok(identity) => {
                term::good(&format!("Provisioned as {}.", identity.thing_name));
                Event::Register(RegisterEvent {
                    device: self.device.clone(),
                    identity,
                })
            }
            Err(err) => Event::failed(err),
        }
    }
}

// RegisterState ===============================================================

/// Adds the device to its thing group and initializes its shadow.
///
/// Registration problems are reported but never stop the run, so this state
/// always fires **`WifiEvent` => `WifiState`**.
#[derive(Debug)]
pub(crate) struct RegisterState {
    pub device: DeviceHandle,
    pub identity: CloudIdentity,
}
impl Runnable for RegisterState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Register {}", self.identity.thing_name);
        term::heading("Registering Device");

        let report = register_device(&*ctx.toolbox.backend, &ctx.settings, &self.identity);
        match &report.grouped {
            Ok(()) => term::good(&format!(
                "Added to thing group {}.",
                ctx.settings.thing_group.name
            )),
            Err(err) => term::warning(&format!(
                "Not added to thing group {}: {}",
                ctx.settings.thing_group.name, err
            )),
        }
        match &report.shadow {
            Ok(()) => term::good("Device shadow initialized."),
            Err(err) => term::warning(&format!("Device shadow not initialized: {}", err)),
        }
        if !report.is_complete() {
            term::warning("Finish the registration from the AWS console.");
        }

        Event::Wifi(WifiEvent {
            device: self.device.clone(),
            identity: self.identity.clone(),
        })
    }
}

// WifiState ===================================================================

#[derive(Debug)]
pub(crate) struct WifiState {
    pub device: DeviceHandle,
    pub identity: CloudIdentity,
}
impl Runnable for WifiState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Wifi {}", ctx.settings.wifi.ssid);
        term::heading("Connecting to WiFi");

        match join_wifi(&*ctx.toolbox.runner, &ctx.settings, &self.device) {
            Ok(()) => {
                term::good(&format!("Joined {}.", ctx.settings.wifi.ssid));
                Event::Done(DoneEvent {
                    result: Ok(self.identity.clone()),
                })
            }
            Err(err) => Event::failed(err),
        }
    }
}

// Done State ==================================================================

/// The end of a run, successful or not.
///
/// Running it persists the session, prints the final report and fires the
/// **`ExitEvent`**, which lands in a new `DoneState` with `should_exit` set.
#[derive(Debug)]
pub(crate) struct DoneState {
    pub result: Option<Result<CloudIdentity, PipelineError>>,
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        let result = match self.result.take() {
            Some(result) => result,
            None => unreachable!("done state was run twice"),
        };
        info!(
            "=> Done with{}errors",
            if result.is_err() { " " } else { " no " }
        );

        if let Err(err) = ctx.store.save(&ctx.session) {
            warn!("{}", err);
            term::warning(&format!("Session not saved: {}", err));
        }

        term::heading("Summary");
        match &result {
            Ok(identity) => {
                term::good("Device ready.");
                term::good(&format!("Serial Number: {}", identity.thing_name));
            }
            Err(err) => {
                term::warning(&err.to_string());
                if let Some(hint) = err.operator_hint() {
                    term::warning(hint);
                }
            }
        }

        Event::Exit(ExitEvent { result })
    }
}
