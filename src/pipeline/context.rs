//! Everything the pipeline stages share: the settings, the session and the
//! outside world.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{Local, NaiveDate};

use crate::{
    cloud::{AwsCli, CloudBackend},
    repo::{GitUpstream, Upstream},
    session::{SessionState, SessionStore},
    tools::{ProcessInvoker, ToolRunner},
    utils::{Operator, PortProber, SerialProber, TerminalOperator},
    Settings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The collaborators a provisioning run talks to.
///
/// [`Toolbox::system`] wires the real ones. Tests swap any of them for fakes.
pub struct Toolbox {
    pub runner: Box<dyn ToolRunner>,
    pub backend: Box<dyn CloudBackend>,
    pub upstream: Box<dyn Upstream>,
    pub prober: Box<dyn PortProber>,
    pub operator: Box<dyn Operator>,
    /// The calendar day used for the once-per-day synchronization.
    pub today: Box<dyn Fn() -> NaiveDate>,
    /// Raised by the Ctrl+C handler.
    pub interrupted: Arc<AtomicBool>,
}
impl Toolbox {
    /// Real tools, real ports, real terminal.
    pub fn system(settings: &Settings, interrupted: Arc<AtomicBool>) -> Self {
        let invoker = ProcessInvoker::new(settings.tool_timeout, interrupted.clone())
            .echo_output(settings.show_tool_output);
        Toolbox {
            backend: Box::new(AwsCli::new(invoker.clone(), settings)),
            runner: Box::new(invoker),
            upstream: Box::new(GitUpstream::new(settings)),
            prober: Box::new(SerialProber::new(settings)),
            operator: Box::new(TerminalOperator),
            today: Box::new(|| Local::now().date_naive()),
            interrupted,
        }
    }
}
impl fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolbox")
            .field("interrupted", &self.interrupted)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Shared by all states of the pipeline, for the whole run.
#[derive(Debug)]
pub(crate) struct Context {
    pub settings: Settings,
    pub toolbox: Toolbox,
    pub store: SessionStore,
    pub session: SessionState,
}
impl Context {
    pub(crate) fn new(settings: Settings, toolbox: Toolbox) -> Self {
        Context {
            store: SessionStore::new(&settings.state_file),
            session: SessionState::never_synced(),
            settings,
            toolbox,
        }
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.toolbox.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn today(&self) -> NaiveDate {
        (self.toolbox.today)()
    }
}
