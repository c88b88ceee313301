//! Serial device discovery and selection.
//!
//! Candidates are the platform's serial ports whose path follows the
//! configured naming convention. A candidate only counts if it can be opened;
//! it is closed again right away so the flashing tools can grab it later.
//!
//! The number of live candidates decides what happens next:
//!
//!  * none: [`DiscoveryError::NoDeviceFound`],
//!  * one: it is selected without asking,
//!  * more: the operator picks one from a numbered list, or presses enter for
//!    the default, which is the first candidate.

use std::{
    convert::TryFrom,
    fmt, io,
    num::{IntErrorKind, ParseIntError},
    time::Duration,
};

use console::{style, Term};
use log::{debug, info, warn};
use serialport::available_ports;
use thiserror::Error;

use crate::{utils::term, Settings};

/// Index of the candidate picked when the operator just presses enter.
pub const DEFAULT_CANDIDATE: usize = 0;

/// How many times the operator is asked before a bad answer becomes an error.
const MAX_PROMPTS: usize = 3;

//==============================================================================
// Public Interface
//==============================================================================

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceCandidate {
    pub path: String,
}

/// The one device a provisioning run works with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceHandle {
    path: String,
}
impl DeviceHandle {
    pub fn path(&self) -> &str {
        &self.path
    }
}
impl From<DeviceCandidate> for DeviceHandle {
    fn from(candidate: DeviceCandidate) -> Self {
        DeviceHandle {
            path: candidate.path,
        }
    }
}
impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("device number {index} is out of range, pick one between 1 and {count}")]
    OutOfRange { index: String, count: usize },

    #[error("`{0}` is not a device number")]
    NotANumber(String),

    #[error("could not read the device choice: {0}")]
    Prompt(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no device found")]
    NoDeviceFound,

    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// Where candidate endpoints come from.
pub trait PortProber {
    /// Endpoint paths, in platform enumeration order.
    fn enumerate(&self) -> Vec<String>;

    /// Whether the endpoint can be opened. It is closed again before returning.
    fn probe(&self, path: &str) -> bool;
}

/// The operator in front of the terminal.
pub trait Operator {
    /// Present the numbered candidates and return the raw answer. An empty
    /// answer accepts the candidate at `default`.
    fn choose(&mut self, candidates: &[DeviceCandidate], default: usize) -> io::Result<String>;

    /// Called when an answer was rejected, before asking again.
    fn rejected(&mut self, _error: &SelectionError) {}
}

/// Probes real serial ports with the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialProber {
    prefix: String,
    baud_rate: u32,
    explicit: Option<String>,
}
impl SerialProber {
    pub fn new(settings: &Settings) -> Self {
        SerialProber {
            prefix: settings.port_prefix.clone(),
            baud_rate: settings.baud_rate,
            explicit: settings.device.clone(),
        }
    }
}
impl PortProber for SerialProber {
    fn enumerate(&self) -> Vec<String> {
        if let Some(path) = &self.explicit {
            return vec![path.clone()];
        }
        match available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| p.port_name)
                .filter(|name| name.starts_with(&self.prefix))
                .collect(),
            Err(ref e) => {
                info!("error: {}", e);
                vec![]
            }
        }
    }

    fn probe(&self, path: &str) -> bool {
        match serialport::new(path, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
        {
            // Dropping the port closes it.
            Ok(_port) => true,
            Err(e) => {
                debug!("`{}` discarded: {}", path, e);
                false
            }
        }
    }
}

/// Asks on the terminal with `dialoguer`.
#[derive(Debug, Default)]
pub struct TerminalOperator;
impl Operator for TerminalOperator {
    fn choose(&mut self, candidates: &[DeviceCandidate], default: usize) -> io::Result<String> {
        use dialoguer::{theme::ColorfulTheme, Input};

        let items: Vec<String> = candidates.iter().map(|c| c.path.clone()).collect();
        term::numbered(&items);

        let default_path = items.get(default).cloned().unwrap_or_default();
        let theme = ColorfulTheme::default();
        // Bound first: the prompt borrows `theme` and must be dropped before it.
        let answer = Input::<String>::with_theme(&theme)
            .with_prompt(format!(
                "Press enter to use the default port at {} or input a number",
                style(default_path).bold()
            ))
            .allow_empty(true)
            .interact_text_on(&Term::stderr());
        answer
    }

    fn rejected(&mut self, error: &SelectionError) {
        term::warning(&error.to_string());
    }
}

/// The live candidates, in enumeration order.
pub fn discover_candidates(prober: &dyn PortProber) -> Vec<DeviceCandidate> {
    prober
        .enumerate()
        .into_iter()
        .filter(|path| prober.probe(path))
        .map(|path| DeviceCandidate { path })
        .collect()
}

/// Turn the operator's answer into a candidate index.
///
/// Empty input selects [`DEFAULT_CANDIDATE`], a number `k` in `1..=N` selects
/// candidate `k - 1`.
pub fn resolve_selection(
    candidates: &[DeviceCandidate],
    input: &str,
) -> Result<usize, SelectionError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(DEFAULT_CANDIDATE);
    }

    let count = candidates.len();
    let out_of_range = || SelectionError::OutOfRange {
        index: input.to_owned(),
        count,
    };
    // A number too large for any integer is still a number.
    let index: i64 = input.parse().map_err(|e: ParseIntError| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => out_of_range(),
        _ => SelectionError::NotANumber(input.to_owned()),
    })?;
    match usize::try_from(index) {
        Ok(k) if k >= 1 && k <= count => Ok(k - 1),
        _ => Err(out_of_range()),
    }
}

/// Discover the candidates and settle on exactly one device.
pub fn select_device(
    prober: &dyn PortProber,
    operator: &mut dyn Operator,
) -> Result<DeviceHandle, DiscoveryError> {
    let mut candidates = discover_candidates(prober);
    info!("{} live serial device(s)", candidates.len());

    if candidates.len() <= 1 {
        return candidates
            .pop()
            .map(DeviceHandle::from)
            .ok_or(DiscoveryError::NoDeviceFound);
    }

    let mut attempt = 1;
    loop {
        let answer = operator
            .choose(&candidates, DEFAULT_CANDIDATE)
            .map_err(SelectionError::from)?;
        match resolve_selection(&candidates, &answer) {
            Ok(index) => return Ok(candidates.swap_remove(index).into()),
            Err(err) if attempt < MAX_PROMPTS => {
                warn!("rejected device choice: {}", err);
                operator.rejected(&err);
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
struct FakePorts(Vec<(&'static str, bool)>);
#[cfg(test)]
impl PortProber for FakePorts {
    fn enumerate(&self) -> Vec<String> {
        self.0.iter().map(|(path, _)| path.to_string()).collect()
    }

    fn probe(&self, path: &str) -> bool {
        self.0.iter().any(|(p, live)| *p == path && *live)
    }
}

#[cfg(test)]
struct Scripted {
    answers: Vec<&'static str>,
    asked: usize,
    rejections: usize,
}
#[cfg(test)]
impl Scripted {
    fn new(answers: &[&'static str]) -> Self {
        Scripted {
            answers: answers.to_vec(),
            asked: 0,
            rejections: 0,
        }
    }
}
#[cfg(test)]
impl Operator for Scripted {
    fn choose(&mut self, _: &[DeviceCandidate], default: usize) -> io::Result<String> {
        assert_eq!(default, DEFAULT_CANDIDATE);
        let answer = self
            .answers
            .get(self.asked)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more answers"))?;
        self.asked += 1;
        Ok(answer.to_string())
    }

    fn rejected(&mut self, _: &SelectionError) {
        self.rejections += 1;
    }
}

#[cfg(test)]
fn three_ports() -> FakePorts {
    FakePorts(vec![
        ("/dev/ttyUSB0", true),
        ("/dev/ttyUSB1", true),
        ("/dev/ttyUSB2", true),
    ])
}

#[test]
fn busy_ports_are_discarded() {
    let ports = FakePorts(vec![
        ("/dev/ttyUSB0", false),
        ("/dev/ttyUSB1", true),
        ("/dev/ttyUSB2", false),
    ]);
    let candidates = discover_candidates(&ports);
    assert_eq!(
        candidates,
        vec![DeviceCandidate {
            path: "/dev/ttyUSB1".into()
        }]
    );
}

#[test]
fn no_candidates() {
    let ports = FakePorts(vec![("/dev/ttyUSB0", false)]);
    let mut operator = Scripted::new(&[]);
    match select_device(&ports, &mut operator) {
        Err(DiscoveryError::NoDeviceFound) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(operator.asked, 0);
}

#[test]
fn single_candidate_is_selected_without_prompt() {
    let ports = FakePorts(vec![("/dev/ttyUSB0", false), ("/dev/ttyUSB1", true)]);
    let mut operator = Scripted::new(&[]);
    let device = select_device(&ports, &mut operator).unwrap();
    assert_eq!(device.path(), "/dev/ttyUSB1");
    assert_eq!(operator.asked, 0);
}

#[test]
fn enter_selects_the_first_candidate() {
    let mut operator = Scripted::new(&[""]);
    let device = select_device(&three_ports(), &mut operator).unwrap();
    assert_eq!(device.path(), "/dev/ttyUSB0");
    assert_eq!(operator.asked, 1);
}

#[test]
fn number_selects_candidate() {
    let mut operator = Scripted::new(&["3"]);
    let device = select_device(&three_ports(), &mut operator).unwrap();
    assert_eq!(device.path(), "/dev/ttyUSB2");
}

#[test]
fn out_of_range_is_rejected() {
    let candidates = discover_candidates(&three_ports());
    match resolve_selection(&candidates, "4") {
        Err(SelectionError::OutOfRange { index, count }) => {
            assert_eq!(index, "4");
            assert_eq!(count, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        resolve_selection(&candidates, "0"),
        Err(SelectionError::OutOfRange { .. })
    ));
    assert!(matches!(
        resolve_selection(&candidates, "-1"),
        Err(SelectionError::OutOfRange { .. })
    ));
    assert!(matches!(
        resolve_selection(&candidates, "two"),
        Err(SelectionError::NotANumber(_))
    ));
    assert_eq!(resolve_selection(&candidates, " 2 \n").unwrap(), 1);
}

#[test]
fn overflowing_number_is_out_of_range() {
    let candidates = discover_candidates(&three_ports());
    for input in &["99999999999999999999", "-99999999999999999999"] {
        match resolve_selection(&candidates, input) {
            Err(SelectionError::OutOfRange { index, count }) => {
                assert_eq!(&index, input);
                assert_eq!(count, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn bad_answer_is_asked_again() {
    let mut operator = Scripted::new(&["9", "2"]);
    let device = select_device(&three_ports(), &mut operator).unwrap();
    assert_eq!(device.path(), "/dev/ttyUSB1");
    assert_eq!(operator.asked, 2);
    assert_eq!(operator.rejections, 1);
}

#[test]
fn repeated_bad_answers_fail() {
    let mut operator = Scripted::new(&["9", "0", "7", "1"]);
    match select_device(&three_ports(), &mut operator) {
        Err(DiscoveryError::Selection(SelectionError::OutOfRange { index, .. })) => {
            assert_eq!(index, "7")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(operator.asked, MAX_PROMPTS);
}

#[test]
fn explicit_device_is_the_only_candidate() {
    let settings = crate::SettingsBuilder::new()
        .device("/dev/ttyACM3")
        .finalize();
    let prober = SerialProber::new(&settings);
    assert_eq!(prober.enumerate(), vec!["/dev/ttyACM3".to_string()]);
}
