//! Helpers for serial device discovery and operator-facing terminal output.

mod ports;
pub(crate) mod term;

pub use ports::{
    discover_candidates, resolve_selection, select_device, DeviceCandidate, DeviceHandle,
    DiscoveryError, Operator, PortProber, SelectionError, SerialProber, TerminalOperator,
    DEFAULT_CANDIDATE,
};
