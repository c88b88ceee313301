//! Events for the provisioning pipeline state machine.
//!
//! This modules is private and restricted to the [`pipeline`](crate::pipeline)
//! scope. Each event carries what the next stage needs from the previous
//! ones, so data only ever flows forward.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use crate::{cloud::CloudIdentity, error::PipelineError, utils::DeviceHandle};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// SyncEvent ===================================================================

/// Fired once the session is loaded, to check the firmware repository.
#[derive(Debug)]
pub(crate) struct SyncEvent {}

// BuildEvent ==================================================================

/// Fired after the repository check. `rebuild_required` is only set when new
/// firmware sources were pulled.
#[derive(Debug)]
pub(crate) struct BuildEvent {
    pub rebuild_required: bool,
}

// FindDeviceEvent =============================================================

/// Fired when a usable firmware image is available.
#[derive(Debug)]
pub(crate) struct FindDeviceEvent {}

// FlashEvent ==================================================================

/// Fired when exactly one device was selected. From here on, every stage works
/// on that device.
#[derive(Debug)]
pub(crate) struct FlashEvent {
    pub device: DeviceHandle,
}

// ProvisionEvent ==============================================================

#[derive(Debug)]
pub(crate) struct ProvisionEvent {
    pub device: DeviceHandle,
}

// RegisterEvent ===============================================================

/// Fired when the device has a cloud identity.
#[derive(Debug)]
pub(crate) struct RegisterEvent {
    pub device: DeviceHandle,
    pub identity: CloudIdentity,
}

// WifiEvent ===================================================================

#[derive(Debug)]
pub(crate) struct WifiEvent {
    pub device: DeviceHandle,
    pub identity: CloudIdentity,
}

// DoneEvent ===================================================================

/// Fired when the run is over, either because the last stage succeeded or
/// because a stage failed. Can happen from any state.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub result: Result<CloudIdentity, PipelineError>,
}

// ExitEvent ===================================================================

/// The last event of a run. It hands the final result back to the caller of
/// the event loop.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub result: Result<CloudIdentity, PipelineError>,
}

// Events enum ==================================================================

/// Events that can be triggered within the provisioning pipeline.
#[derive(Debug)]
pub(crate) enum Event {
    Sync(SyncEvent),
    Build(BuildEvent),
    FindDevice(FindDeviceEvent),
    Flash(FlashEvent),
    Provision(ProvisionEvent),
    Register(RegisterEvent),
    Wifi(WifiEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
impl Event {
    /// Shorthand for ending the run with an error.
    pub(crate) fn failed(error: impl Into<PipelineError>) -> Self {
        Event::Done(DoneEvent {
            result: Err(error.into()),
        })
    }
}
