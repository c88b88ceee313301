//! The provisioning pipeline as a state machine.
//!
//! A run takes one device from a firmware working copy to a registered,
//! connected thing. Stages run strictly in order and each one only starts when
//! the previous one succeeded. Any failure, as well as an interrupt from the
//! operator, short-circuits to `Done`, which persists the session and reports.
//!
//! The following state diagram summarizes the different states and transitions
//! a run goes through:
//!
//! ```text
//!                 START
//!                   |
//!                   v
//!              .---------.
//!              |  Init   |  load session
//!              '---------'
//!                   |
//!                   v
//!              .---------.
//!              |  Sync   |  pull at most once a day
//!              '---------'
//!                   |
//!                   v
//!              .---------.
//!              |  Build  |---------------------.
//!              '---------'                     |
//!                   |                          |
//!                   v                          |
//!             .------------.                   |
//!             | FindDevice |-------------------|
//!             '------------'                   |
//!                   |                          |
//!                   v                          |
//!              .---------.                     |
//!              |  Flash  |---------------------|
//!              '---------'                     |
//!                   |                          |
//!                   v                          |   error or
//!             .-----------.                    |   interrupt
//!             | Provision |--------------------|
//!             '-----------'                    |
//!                   |                          |
//!                   v                          |
//!             .----------.                     |
//!             | Register |  never fails        |
//!             '----------'                     |
//!                   |                          |
//!                   v                          |
//!              .---------.                     |
//!              |  Wifi   |---------------------|
//!              '---------'                     |
//!                   |                          v
//!                   |                     .---------.
//!                   '-------------------->|  Done   |  save session, report
//!                                         '---------'
//!                                              |
//!                                              v
//!                                             END
//! ```

use super::context::{Context, Toolbox};
use super::events::*;
use super::states::*;
use crate::{cloud::CloudIdentity, error::PipelineError, session::SessionState, Settings};

// =============================================================================
// Public Interface
// =============================================================================

/// Encapsulate the state machine creation and event loop to provide a concise
/// and simple public interface to the module users.
///
/// Use the `factory()` function to get an instance then run it by calling its
/// `run()` method.
#[derive(Debug)]
pub struct Provisioner {
    ctx: Context,
    sm: PipelineStates,
}
impl Provisioner {
    /// The pipeline event loop runs until the `Done` state is reached and its
    /// `should_exit` flag is set. At such point, the event loop terminates and
    /// returns the identity of the provisioned device, or what stopped the run.
    ///
    /// Use [`PipelineError::exit_code`] to turn the error into an exit code.
    pub fn run(&mut self) -> Result<CloudIdentity, PipelineError> {
        loop {
            self.sm = self.sm.step(&mut self.ctx);
            if let PipelineStates::Done(state) = &mut self.sm {
                if state.should_exit {
                    if let Some(result) = state.result.take() {
                        return result;
                    }
                }
            }
        }
    }

    /// The session as it currently stands. After `run()`, this is what was
    /// persisted.
    pub fn session(&self) -> &SessionState {
        &self.ctx.session
    }
}

/// Factory function for the provisioning pipeline. Use it to get an instance
/// of the state machine, which you can run by invoking its `run()` method.
pub fn factory(settings: Settings, toolbox: Toolbox) -> Provisioner {
    Provisioner {
        ctx: Context::new(settings, toolbox),
        // The machine naturally starts in the `Init` state.
        sm: PipelineStates::Init(InitState {}),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Wraps the various states into a simple enum, which can also be used for
/// pattern matching during state transitions.
#[derive(Debug)]
enum PipelineStates {
    Init(InitState),
    Sync(SyncState),
    Build(BuildState),
    FindDevice(FindDeviceState),
    Flash(FlashState),
    Provision(ProvisionState),
    Register(RegisterState),
    Wifi(WifiState),
    Done(DoneState),
}
impl PipelineStates {
    fn step(&mut self, ctx: &mut Context) -> Self {
        // An interrupt is honored between stages, once the session is loaded.
        // A tool that is running when it arrives is killed by the invoker and
        // reports it on its own.
        let stoppable = !matches!(self, PipelineStates::Init(_) | PipelineStates::Done(_));
        if stoppable && ctx.interrupted() {
            log::warn!("interrupted before {:?}", self);
            return PipelineStates::Done(
                DoneEvent {
                    result: Err(PipelineError::Interrupted),
                }
                .into(),
            );
        }

        match self {
            PipelineStates::Init(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Sync(ev) => PipelineStates::Sync(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Sync(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Build(ev) => PipelineStates::Build(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Build(state) => {
                let event = state.run(ctx);
                match event {
                    Event::FindDevice(ev) => PipelineStates::FindDevice(ev.into()),
                    Event::Done(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::FindDevice(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Flash(ev) => PipelineStates::Flash(ev.into()),
                    Event::Done(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Flash(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Provision(ev) => PipelineStates::Provision(ev.into()),
                    Event::Done(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Provision(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Register(ev) => PipelineStates::Register(ev.into()),
                    Event::Done(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Register(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Wifi(ev) => PipelineStates::Wifi(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Wifi(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Done(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
            PipelineStates::Done(state) => {
                let event = state.run(ctx);
                match event {
                    Event::Exit(ev) => PipelineStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, state),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<SyncEvent> for SyncState {
    fn from(_: SyncEvent) -> SyncState {
        SyncState {}
    }
}

impl From<BuildEvent> for BuildState {
    fn from(event: BuildEvent) -> BuildState {
        BuildState {
            rebuild_required: event.rebuild_required,
        }
    }
}

impl From<FindDeviceEvent> for FindDeviceState {
    fn from(_: FindDeviceEvent) -> FindDeviceState {
        FindDeviceState {}
    }
}

impl From<FlashEvent> for FlashState {
    fn from(event: FlashEvent) -> FlashState {
        FlashState {
            device: event.device,
        }
    }
}

impl From<ProvisionEvent> for ProvisionState {
    fn from(event: ProvisionEvent) -> ProvisionState {
        ProvisionState {
            device: event.device,
        }
    }
}

impl From<RegisterEvent> for RegisterState {
    fn from(event: RegisterEvent) -> RegisterState {
        RegisterState {
            device: event.device,
            identity: event.identity,
        }
    }
}

impl From<WifiEvent> for WifiState {
    fn from(event: WifiEvent) -> WifiState {
        WifiState {
            device: event.device,
            identity: event.identity,
        }
    }
}

impl From<DoneEvent> for DoneState {
    fn from(event: DoneEvent) -> DoneState {
        DoneState {
            result: Some(event.result),
            should_exit: false,
        }
    }
}
impl From<ExitEvent> for DoneState {
    fn from(event: ExitEvent) -> DoneState {
        DoneState {
            result: Some(event.result),
            should_exit: true,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
use crate::error::Stage;

#[test]
fn done_event_lands_in_a_running_done_state() {
    let state: DoneState = DoneEvent {
        result: Err(PipelineError::NoDeviceFound),
    }
    .into();
    assert!(!state.should_exit);
    assert!(matches!(
        state.result,
        Some(Err(PipelineError::NoDeviceFound))
    ));
}

#[test]
fn exit_event_lands_in_an_exiting_done_state() {
    let state: DoneState = ExitEvent {
        result: Err(PipelineError::Fatal {
            stage: Stage::Flash,
            reason: "Error: no reply".into(),
        }),
    }
    .into();
    assert!(state.should_exit);
}

#[test]
fn device_is_carried_forward() {
    let device = crate::utils::DeviceHandle::from(crate::utils::DeviceCandidate {
        path: "/dev/ttyUSB1".into(),
    });
    let state: ProvisionState = ProvisionEvent {
        device: device.clone(),
    }
    .into();
    assert_eq!(state.device, device);
}
