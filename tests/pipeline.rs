//! End-to-end runs of the provisioning pipeline against scripted tools,
//! devices and cloud.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs, io,
    path::Path,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc},
};

use chrono::NaiveDate;

use mosprov::{
    self as mp,
    cloud::{CloudBackend, CloudError, CloudIdentity},
    repo::{SyncError, Upstream},
    session::{SessionState, SessionStore},
    tools::{InvocationResult, InvokeError, ToolCommand, ToolRunner},
    utils::{DeviceCandidate, Operator, PortProber},
    PipelineError, Settings, Stage, ThingGroup, Toolbox,
};

const SETUP_OUTPUT: &str = "\
Using port /dev/ttyUSB0
Generating certificate request, type: ECDSA
Creating certificate...
Updating config:
  aws.mqtt.server = a1b2c3-ats.iot.us-east-1.amazonaws.com:8883
  aws.thing_name = esp32_0A1B2C
Saving and rebooting...
";

type Log = Rc<RefCell<Vec<String>>>;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
}

// Fakes =======================================================================

/// Answers each `mos` subcommand with a canned result and records every
/// command line it sees.
struct ScriptedTools {
    replies: HashMap<&'static str, InvocationResult>,
    log: Log,
}
impl ToolRunner for ScriptedTools {
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError> {
        self.log.borrow_mut().push(command.to_string());
        let subcommand = command.args().first().map(String::as_str).unwrap_or("");
        Ok(self
            .replies
            .get(subcommand)
            .cloned()
            .unwrap_or_else(|| InvocationResult::new(Some(1), "", "unknown command")))
    }
}

struct FakeCloud {
    group_fails: bool,
    log: Log,
}
impl CloudBackend for FakeCloud {
    fn describe_thing(&self, token: &str) -> Result<CloudIdentity, CloudError> {
        self.log.borrow_mut().push(format!("describe {}", token));
        Ok(CloudIdentity {
            thing_name: token.to_owned(),
            thing_arn: format!("arn:aws:iot:us-east-1:123456789012:thing/{}", token),
            raw_description: "{}".into(),
        })
    }

    fn add_thing_to_group(
        &self,
        group: &ThingGroup,
        identity: &CloudIdentity,
    ) -> Result<(), CloudError> {
        self.log
            .borrow_mut()
            .push(format!("group {} {}", group.name, identity.thing_name));
        if self.group_fails {
            Err(CloudError::Rejected {
                operation: "add-thing-to-thing-group",
                message: "AccessDeniedException".into(),
            })
        } else {
            Ok(())
        }
    }

    fn update_shadow(&self, identity: &CloudIdentity, _: &str) -> Result<(), CloudError> {
        self.log
            .borrow_mut()
            .push(format!("shadow {}", identity.thing_name));
        Ok(())
    }
}

struct FakeUpstream {
    log: Log,
}
impl Upstream for FakeUpstream {
    fn pull(&self) -> Result<(), SyncError> {
        self.log.borrow_mut().push("pull".into());
        Ok(())
    }
}

struct FakePorts(Vec<&'static str>);
impl PortProber for FakePorts {
    fn enumerate(&self) -> Vec<String> {
        self.0.iter().map(|p| p.to_string()).collect()
    }

    fn probe(&self, _: &str) -> bool {
        true
    }
}

/// Replays the answers in order. `^C` stands for Ctrl+C at the prompt.
struct Answers(Vec<&'static str>);
impl Operator for Answers {
    fn choose(&mut self, _: &[DeviceCandidate], _: usize) -> io::Result<String> {
        if self.0.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more answers"));
        }
        match self.0.remove(0) {
            "^C" => Err(io::Error::new(io::ErrorKind::Interrupted, "read interrupted")),
            answer => Ok(answer.to_owned()),
        }
    }
}

// Harness =====================================================================

struct Bench {
    dir: tempfile::TempDir,
    replies: HashMap<&'static str, InvocationResult>,
    ports: Vec<&'static str>,
    answers: Vec<&'static str>,
    group_fails: bool,
    interrupted: bool,
    tools: Log,
    cloud: Log,
    upstream: Log,
}
impl Bench {
    fn new() -> Self {
        Bench {
            dir: tempfile::tempdir().unwrap(),
            replies: HashMap::new(),
            ports: vec!["/dev/ttyUSB0"],
            answers: Vec::new(),
            group_fails: false,
            interrupted: false,
            tools: Log::default(),
            cloud: Log::default(),
            upstream: Log::default(),
        }
    }

    /// The replies of a run where every tool reports success.
    fn all_good(self) -> Self {
        self.reply("build", "Success, built BX1/esp32 version 1.0\n")
            .reply("flash", "Writing...\nAll done!\n")
            .reply("aws-iot-setup", SETUP_OUTPUT)
            .reply("wifi", "Setting WiFi config...\nSaving and rebooting...\n")
    }

    fn reply(mut self, subcommand: &'static str, stderr: &str) -> Self {
        self.replies
            .insert(subcommand, InvocationResult::new(Some(0), "", stderr));
        self
    }

    fn reply_stdout(mut self, subcommand: &'static str, stdout: &str) -> Self {
        self.replies
            .insert(subcommand, InvocationResult::new(Some(0), stdout, ""));
        self
    }

    fn with_artifact(self) -> Self {
        let build = self.dir.path().join("repo").join("build");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("fw.zip"), b"PK").unwrap();
        self
    }

    fn synced_on(self, day: NaiveDate) -> Self {
        SessionStore::new(self.state_file())
            .save(&SessionState {
                last_sync_date: day,
            })
            .unwrap();
        self
    }

    fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join("state").join("session.json")
    }

    fn settings(&self) -> Settings {
        let repo = self.dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        mp::SettingsBuilder::new()
            .repo_path(&repo)
            .state_file(self.state_file())
            .wifi("workshop", "hunter2")
            .finalize()
    }

    fn run(&self) -> Result<CloudIdentity, PipelineError> {
        let toolbox = Toolbox {
            runner: Box::new(ScriptedTools {
                replies: self.replies.clone(),
                log: self.tools.clone(),
            }),
            backend: Box::new(FakeCloud {
                group_fails: self.group_fails,
                log: self.cloud.clone(),
            }),
            upstream: Box::new(FakeUpstream {
                log: self.upstream.clone(),
            }),
            prober: Box::new(FakePorts(self.ports.clone())),
            operator: Box::new(Answers(self.answers.clone())),
            today: Box::new(today),
            interrupted: Arc::new(AtomicBool::new(self.interrupted)),
        };
        mp::factory(self.settings(), toolbox).run()
    }

    fn persisted(&self) -> NaiveDate {
        persisted_date(&self.state_file())
    }

    fn tool_runs(&self) -> Vec<String> {
        self.tools.borrow().clone()
    }
}

fn persisted_date(path: &Path) -> NaiveDate {
    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    document["last_sync_date"].as_str().unwrap().parse().unwrap()
}

// Scenarios ===================================================================

#[test]
fn unrecognized_build_stops_before_the_device_is_touched() {
    let bench = Bench::new().reply_stdout("build", "...done.\n");

    let err = bench.run().unwrap_err();
    match &err {
        PipelineError::Unrecognized {
            stage: Stage::Build,
            output,
        } => assert!(output.contains("...done.")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);

    let runs = bench.tool_runs();
    assert_eq!(runs, vec!["mos build --arch esp32".to_string()]);
    assert!(bench.cloud.borrow().is_empty());

    // No state file existed: the pull happened and its date was persisted.
    assert_eq!(*bench.upstream.borrow(), vec!["pull".to_string()]);
    assert_eq!(bench.persisted(), today());
}

#[test]
fn cached_build_provisions_the_single_device() {
    let bench = Bench::new().all_good().with_artifact().synced_on(today());

    let identity = bench.run().unwrap();
    assert_eq!(identity.thing_name, "esp32_0A1B2C");

    assert!(bench.upstream.borrow().is_empty());
    assert_eq!(
        bench.tool_runs(),
        vec![
            "mos flash --port /dev/ttyUSB0".to_string(),
            "mos aws-iot-setup --port /dev/ttyUSB0".to_string(),
            "mos wifi workshop ******** --port /dev/ttyUSB0".to_string(),
        ]
    );
    assert_eq!(
        *bench.cloud.borrow(),
        vec![
            "describe esp32_0A1B2C".to_string(),
            "group BX1-Things esp32_0A1B2C".to_string(),
            "shadow esp32_0A1B2C".to_string(),
        ]
    );
    assert_eq!(bench.persisted(), today());
}

#[test]
fn stale_session_pulls_and_rebuilds() {
    let yesterday = today().pred_opt().unwrap();
    let bench = Bench::new().all_good().with_artifact().synced_on(yesterday);

    bench.run().unwrap();
    assert_eq!(*bench.upstream.borrow(), vec!["pull".to_string()]);
    assert_eq!(bench.tool_runs()[0], "mos build --arch esp32");
    assert_eq!(bench.persisted(), today());
}

#[test]
fn no_device_exits_with_its_own_code() {
    let mut bench = Bench::new().all_good().with_artifact().synced_on(today());
    bench.ports.clear();

    let err = bench.run().unwrap_err();
    assert!(matches!(err, PipelineError::NoDeviceFound));
    assert_eq!(err.exit_code(), 2);
    assert!(err.operator_hint().is_some());
    assert!(bench.tool_runs().is_empty());
}

#[test]
fn operator_picks_among_several_devices() {
    let mut bench = Bench::new().all_good().with_artifact().synced_on(today());
    bench.ports = vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"];
    bench.answers = vec!["7", "2"];

    bench.run().unwrap();
    assert_eq!(bench.tool_runs()[0], "mos flash --port /dev/ttyUSB1");
}

#[test]
fn ctrl_c_at_the_prompt_is_an_interrupt() {
    let mut bench = Bench::new().all_good().with_artifact().synced_on(today());
    bench.ports = vec!["/dev/ttyUSB0", "/dev/ttyUSB1"];
    bench.answers = vec!["^C"];

    let err = bench.run().unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert!(bench.tool_runs().is_empty());
    assert_eq!(bench.persisted(), today());
}

#[test]
fn empty_answer_takes_the_first_device() {
    let mut bench = Bench::new().all_good().with_artifact().synced_on(today());
    bench.ports = vec!["/dev/ttyUSB3", "/dev/ttyUSB4"];
    bench.answers = vec![""];

    bench.run().unwrap();
    assert_eq!(bench.tool_runs()[0], "mos flash --port /dev/ttyUSB3");
}

#[test]
fn flash_error_stops_the_run() {
    let bench = Bench::new()
        .all_good()
        .reply("flash", "Error: Failed to talk to bootloader.\n")
        .with_artifact()
        .synced_on(today());

    let err = bench.run().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Fatal {
            stage: Stage::Flash,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(bench.tool_runs().len(), 1);
    assert!(bench.cloud.borrow().is_empty());
}

#[test]
fn setup_without_identity_is_fatal() {
    let bench = Bench::new()
        .all_good()
        .reply("aws-iot-setup", "Updating config:\nSaving and rebooting...\n")
        .with_artifact()
        .synced_on(today());

    let err = bench.run().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Provision));
    assert!(bench.cloud.borrow().is_empty());
    assert!(!bench.tool_runs().iter().any(|run| run.contains(" wifi ")));
}

#[test]
fn registration_problems_do_not_stop_the_run() {
    let mut bench = Bench::new().all_good().with_artifact().synced_on(today());
    bench.group_fails = true;

    let identity = bench.run().unwrap();
    assert_eq!(identity.thing_name, "esp32_0A1B2C");
    assert_eq!(bench.cloud.borrow().len(), 3);
    assert!(bench.tool_runs()[2].starts_with("mos wifi"));
}

#[test]
fn interrupt_before_start_still_persists_the_session() {
    let mut bench = Bench::new().all_good().with_artifact();
    bench.interrupted = true;

    let err = bench.run().unwrap_err();
    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert!(bench.tool_runs().is_empty());
    assert_eq!(bench.persisted(), SessionState::never_synced().last_sync_date);
}
