//! The provisioning pipeline.
//!
//! **Example** - Executing the state machine event loop:
//! ```no_run
//! use std::sync::{atomic::AtomicBool, Arc};
//!
//! use mosprov::{self as mp, Toolbox};
//!
//! let settings = mp::SettingsBuilder::default()
//!     .wifi("workshop", "hunter2")
//!     .finalize();
//! let toolbox = Toolbox::system(&settings, Arc::new(AtomicBool::new(false)));
//! let mut provisioner = mp::factory(settings, toolbox);
//! let code = match provisioner.run() {
//!     Ok(identity) => {
//!         println!("provisioned {}", identity.thing_name);
//!         0
//!     }
//!     Err(err) => err.exit_code(),
//! };
//! std::process::exit(code);
//! ```

mod context;
mod events;
mod state_machine;
mod states;

pub use context::Toolbox;
pub use state_machine::{factory, Provisioner};
