//! Mosprov provisions Mongoose OS devices for AWS IoT in one run: it keeps the
//! firmware working copy current, builds the firmware, flashes it onto a
//! serial-attached device, bootstraps the device against AWS IoT, registers it
//! in its thing group with an initial shadow, and hands it the wireless
//! credentials.
//!
//! The device work is done by the `mos` tool and the cloud work by the `aws`
//! client. Mosprov drives them, reads their output to decide whether a stage
//! worked, and stops at the first stage that did not, before the device or the
//! cloud is touched any further.
//!
//! Each stage is a state of the [`pipeline`] state machine. What a stage hands
//! to the next one, the selected device and later the cloud identity, rides on
//! the event that triggers the transition, so a stage cannot run without it.
//! Every path ends in `Done`, which persists the session and prints the report.

pub mod cloud;
pub mod error;
pub mod firmware;
pub mod pipeline;
pub mod repo;
pub mod session;
pub mod settings;
pub mod tools;
pub mod utils;

pub use error::{PipelineError, Stage, StageError};
pub use pipeline::{factory, Provisioner, Toolbox};
pub use settings::{Settings, SettingsBuilder, ThingGroup, WifiCredentials};
