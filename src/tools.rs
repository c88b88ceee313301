//! External tool plumbing: running a process to completion and turning its
//! free-text output into an [`Outcome`].
//!
//! **Example** - Classifying a captured flash run:
//! ```
//! use mosprov::tools::{classify, InvocationResult, Outcome, FLASH_MARKERS};
//!
//! let result = InvocationResult::new(Some(0), "", "Flashing...\nAll done!\n");
//! assert_eq!(classify(&result, &FLASH_MARKERS), Outcome::Success("All done!".into()));
//! ```

mod classifier;
mod invoker;

pub use classifier::{
    classify, require_success, Marker, MarkerTable, Outcome, OutcomeKind, BUILD_MARKERS,
    FLASH_MARKERS, PROVISION_MARKERS, WIFI_MARKERS,
};
pub use invoker::{InvocationResult, InvokeError, ProcessInvoker, ToolCommand, ToolRunner};
