//! Settings for a provisioning run: tool locations, firmware repository, serial
//! device discovery, cloud registration and wireless credentials.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values. The finalized [`Settings`] value is
//! created once at startup and handed by reference to every stage.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The anchored pattern used to pull the device identity out of the
/// `aws-iot-setup` output. The first capture group is the identity token.
pub const DEFAULT_IDENTITY_PATTERN: &str = r"(?m)^[ \t]*aws\.thing_name[ \t]*=[ \t]*(\S+)[ \t]*\r?$";

/// The desired-state document pushed to a freshly registered device shadow.
pub const DEFAULT_SHADOW_DOCUMENT: &str = r#"{"state":{"desired":{"state":"ready"}}}"#;

/// Serial device naming convention used to pick candidate endpoints.
#[cfg(target_os = "macos")]
pub const DEFAULT_PORT_PREFIX: &str = "/dev/tty.";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_PORT_PREFIX: &str = "/dev/ttyUSB";

/// Credentials handed to the device so it can join the wireless network.
///
/// The passphrase is masked when the value is debug-printed.
#[derive(Clone, Eq, PartialEq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: String,
}
impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"********")
            .finish()
    }
}

/// The cloud-side device group every provisioned device joins.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ThingGroup {
    pub name: String,
    pub arn: Option<String>,
}

/// Groups all settings used by `mosprov` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// Root of the firmware working copy. Builds and device tools run here.
    pub repo_path: PathBuf,
    /// Remote the firmware is pulled from.
    pub remote: String,
    /// Branch the firmware is pulled from.
    pub branch: String,
    /// The `mos` executable.
    pub mos_path: PathBuf,
    /// The `aws` command line client executable.
    pub aws_path: PathBuf,
    /// Target hardware architecture passed to the build tool.
    pub arch: String,
    /// Build artifact, relative to `repo_path` unless absolute.
    pub artifact: PathBuf,
    /// Where the session state is persisted between runs.
    pub state_file: PathBuf,

    /// An explicit serial endpoint. When set, discovery only considers it.
    pub device: Option<String>,
    /// Endpoint path prefix used to filter the platform's serial ports.
    pub port_prefix: String,
    /// Baud rate used when probing a candidate endpoint.
    pub baud_rate: u32,

    pub wifi: WifiCredentials,
    pub thing_group: ThingGroup,
    /// JSON document pushed to the device shadow after registration.
    pub shadow_document: String,
    /// Regular expression extracting the identity token, see
    /// [`DEFAULT_IDENTITY_PATTERN`].
    pub identity_pattern: String,
    pub region: Option<String>,
    pub profile: Option<String>,

    /// Upper bound for any single external tool invocation.
    pub tool_timeout: Duration,
    /// Echo the raw output of every tool to the terminal.
    pub show_tool_output: bool,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}
impl Settings {
    /// The build artifact location, resolved against the repository root.
    pub fn artifact_path(&self) -> PathBuf {
        if self.artifact.is_absolute() {
            self.artifact.clone()
        } else {
            self.repo_path.join(&self.artifact)
        }
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use mosprov::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .repo_path("/work/BX1")
///     .wifi("workshop", "secret")
///     .finalize();
/// assert_eq!(settings.arch, "esp32");
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                repo_path: PathBuf::from("."),
                remote: "origin".into(),
                branch: "master".into(),
                mos_path: PathBuf::from("mos"),
                aws_path: PathBuf::from("aws"),
                arch: "esp32".into(),
                artifact: Path::new("build").join("fw.zip"),
                state_file: default_state_file(),
                device: None,
                port_prefix: DEFAULT_PORT_PREFIX.into(),
                baud_rate: 115_200,
                wifi: WifiCredentials {
                    ssid: String::new(),
                    passphrase: String::new(),
                },
                thing_group: ThingGroup {
                    name: "BX1-Things".into(),
                    arn: None,
                },
                shadow_document: DEFAULT_SHADOW_DOCUMENT.into(),
                identity_pattern: DEFAULT_IDENTITY_PATTERN.into(),
                region: None,
                profile: None,
                tool_timeout: Duration::from_secs(600),
                show_tool_output: false,
                _private_use_builder: (),
            },
        }
    }

    /// Set the root of the firmware working copy
    pub fn repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.repo_path = path.into();
        self
    }

    /// Set the remote and branch the firmware is pulled from
    pub fn upstream<'a>(
        mut self,
        remote: impl Into<std::borrow::Cow<'a, str>>,
        branch: impl Into<std::borrow::Cow<'a, str>>,
    ) -> Self {
        self.settings.remote = remote.into().into_owned();
        self.settings.branch = branch.into().into_owned();
        self
    }

    /// Set the `mos` executable
    pub fn mos_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.mos_path = path.into();
        self
    }

    /// Set the `aws` executable
    pub fn aws_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.aws_path = path.into();
        self
    }

    /// Set the target hardware architecture
    pub fn arch<'a>(mut self, arch: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.arch = arch.into().into_owned();
        self
    }

    /// Set the build artifact location
    pub fn artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.artifact = path.into();
        self
    }

    /// Set the session state file
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.state_file = path.into();
        self
    }

    /// Set an explicit serial endpoint
    pub fn device<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.device = Some(path.into().into_owned());
        self
    }

    /// Set the serial endpoint naming prefix
    pub fn port_prefix<'a>(mut self, prefix: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.port_prefix = prefix.into().into_owned();
        self
    }

    /// Set the probing baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the wireless network credentials
    pub fn wifi<'a>(
        mut self,
        ssid: impl Into<std::borrow::Cow<'a, str>>,
        passphrase: impl Into<std::borrow::Cow<'a, str>>,
    ) -> Self {
        self.settings.wifi = WifiCredentials {
            ssid: ssid.into().into_owned(),
            passphrase: passphrase.into().into_owned(),
        };
        self
    }

    /// Set the device group
    pub fn thing_group<'a>(
        mut self,
        name: impl Into<std::borrow::Cow<'a, str>>,
        arn: Option<String>,
    ) -> Self {
        self.settings.thing_group = ThingGroup {
            name: name.into().into_owned(),
            arn,
        };
        self
    }

    /// Set the shadow desired-state document
    pub fn shadow_document<'a>(mut self, document: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.shadow_document = document.into().into_owned();
        self
    }

    /// Set the identity extraction pattern
    pub fn identity_pattern<'a>(mut self, pattern: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.identity_pattern = pattern.into().into_owned();
        self
    }

    /// Set the AWS region
    pub fn region<'a>(mut self, region: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.region = Some(region.into().into_owned());
        self
    }

    /// Set the AWS named profile
    pub fn profile<'a>(mut self, profile: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.profile = Some(profile.into().into_owned());
        self
    }

    /// Set the per-invocation timeout
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.settings.tool_timeout = timeout;
        self
    }

    /// Echo raw tool output
    pub fn show_tool_output(mut self, show: bool) -> Self {
        self.settings.show_tool_output = show;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn default_state_file() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("mosprov").join("session.json"),
        None => PathBuf::from(".mosprov-session.json"),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.repo_path, PathBuf::from("."));
    assert_eq!(settings.remote, "origin");
    assert_eq!(settings.mos_path, PathBuf::from("mos"));
    assert_eq!(settings.arch, "esp32");
    assert_eq!(settings.device, None);
    assert_eq!(settings.port_prefix, DEFAULT_PORT_PREFIX);
    assert_eq!(settings.shadow_document, DEFAULT_SHADOW_DOCUMENT);
    assert_eq!(settings.tool_timeout, Duration::from_secs(600));
    assert!(!settings.show_tool_output);
}

#[test]
fn artifact_relative_to_repo() {
    let settings = SettingsBuilder::new().repo_path("/work/BX1").finalize();
    assert_eq!(
        settings.artifact_path(),
        Path::new("/work/BX1").join("build").join("fw.zip")
    );
}

#[test]
fn artifact_absolute() {
    let settings = SettingsBuilder::new()
        .repo_path("/work/BX1")
        .artifact("/tmp/fw.zip")
        .finalize();
    assert_eq!(settings.artifact_path(), PathBuf::from("/tmp/fw.zip"));
}

#[test]
fn device() {
    let settings = SettingsBuilder::new().device("/dev/ttyUSB0").finalize();
    assert_eq!(settings.device.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn thing_group() {
    let settings = SettingsBuilder::new()
        .thing_group("Lab-Things", Some("arn:aws:iot:eu-west-1:1:thinggroup/Lab".into()))
        .finalize();
    assert_eq!(settings.thing_group.name, "Lab-Things");
    assert!(settings.thing_group.arn.is_some());
}

#[test]
fn passphrase_is_masked() {
    let settings = SettingsBuilder::new().wifi("workshop", "hunter2").finalize();
    let printed = format!("{:?}", settings);
    assert!(printed.contains("workshop"));
    assert!(!printed.contains("hunter2"));
}
