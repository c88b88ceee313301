//! Mosprov command line interface.

use std::{
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use log::{debug, LevelFilter};
use simplelog::*;

use mosprov::{self as mp, settings::DEFAULT_PORT_PREFIX, Toolbox};

fn main() {
    println!("[MP] mosprov v{}", crate_version!());

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            println!("🛑 received Ctrl+C again, bailing out!");
            process::exit(130);
        }
        println!("🛑 received Ctrl+C! stopping after the current step");
    })
    .unwrap_or_else(|err| {
        println!("{}: could not install the Ctrl+C handler: {}", style("error").red(), err);
        process::exit(1);
    });

    let matches = cli().get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'mosprov -v -v -v' or 'mosprov -vvv' vs 'mosprov -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    if let Err(err) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        println!("{}: logging disabled: {}", style("warning").yellow(), err);
    }

    // The raw matches are never logged: they hold the passphrase in clear.
    let settings = settings_from(&matches);
    debug!("{:#?}", settings);

    // Run the state machine ===================================================

    let toolbox = Toolbox::system(&settings, interrupted);
    let mut provisioner = mp::factory(settings, toolbox);
    let exit_code = match provisioner.run() {
        Ok(_) => 0,
        Err(err) => err.exit_code(),
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn cli() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(concat!("v", crate_version!()))
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Mosprov takes a Mongoose OS device from a firmware working copy to \
            a registered AWS IoT thing on the wireless network, in one run:\n\
               \t* pulls the firmware repository, at most once a day \n\
               \t* builds the firmware when new sources came in \n\
               \t* finds the connected device, asking when there are several \n\
               \t* flashes the firmware with `mos flash` \n\
               \t* bootstraps the device with `mos aws-iot-setup` \n\
               \t* adds the thing to its group and initializes its shadow \n\
               \t* hands the wireless credentials with `mos wifi` \n\
            \n\
            Every step must succeed for the next one to start. When a step \
            fails, the device and the cloud are left as they are and the \
            reason is reported.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("REPO")
                .help("firmware working copy")
                .long("--repo")
                .takes_value(true)
                .default_value(".")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("REMOTE")
                .help("git remote the firmware is pulled from")
                .long("--remote")
                .takes_value(true)
                .default_value("origin")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BRANCH")
                .help("git branch the firmware is pulled from")
                .long("--branch")
                .takes_value(true)
                .default_value("master")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("MOS")
                .help("the `mos` executable")
                .long("--mos")
                .takes_value(true)
                .default_value("mos")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("AWS")
                .help("the `aws` client executable")
                .long("--aws")
                .takes_value(true)
                .default_value("aws")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("ARCH")
                .help("target architecture for `mos build`")
                .long("--arch")
                .takes_value(true)
                .default_value("esp32")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("ARTIFACT")
                .help("firmware image, relative to the working copy")
                .long("--artifact")
                .takes_value(true)
                .default_value("build/fw.zip")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STATE_FILE")
                .help("where the session is persisted")
                .long_help(
                    "where the session is persisted; defaults to \
                     `mosprov/session.json` in the user data directory.",
                )
                .long("--state-file")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device to use")
                .long_help(
                    "the USB tty device to use; when not set, the connected \
                     devices matching the port prefix are discovered and, \
                     when there are several, you get to pick one.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PORT_PREFIX")
                .help("path prefix of candidate serial devices")
                .long("--port-prefix")
                .takes_value(true)
                .default_value(DEFAULT_PORT_PREFIX)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("baud rate used to probe serial devices")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SSID")
                .help("wireless network the device joins")
                .long("--ssid")
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PASSPHRASE")
                .help("wireless network passphrase")
                .long("--passphrase")
                .env("MOSPROV_WIFI_PASS")
                .hide_env_values(true)
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("THING_GROUP")
                .help("AWS IoT thing group the device joins")
                .long("--thing-group")
                .takes_value(true)
                .default_value("BX1-Things")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("THING_GROUP_ARN")
                .help("ARN of the thing group")
                .long("--thing-group-arn")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("REGION")
                .help("AWS region, overrides the `aws` client configuration")
                .long("--region")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PROFILE")
                .help("AWS profile, overrides the `aws` client configuration")
                .long("--profile")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("TOOL_TIMEOUT")
                .help("seconds any single tool may run")
                .long("--tool-timeout")
                .takes_value(true)
                .default_value("600")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SHOW_TOOL_OUTPUT")
                .help("print the output of every tool")
                .long("--show-tool-output"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
}

fn settings_from(matches: &ArgMatches) -> mp::Settings {
    // Arguments with default values ===========================================

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32)
        .unwrap_or_else(|_| not_a_number(matches, "BAUD_RATE", "baud-rate"));
    let tool_timeout = value_t!(matches.value_of("TOOL_TIMEOUT"), u64)
        .unwrap_or_else(|_| not_a_number(matches, "TOOL_TIMEOUT", "tool-timeout"));

    let mut builder = mp::SettingsBuilder::default()
        .repo_path(value(matches, "REPO"))
        .upstream(value(matches, "REMOTE"), value(matches, "BRANCH"))
        .mos_path(value(matches, "MOS"))
        .aws_path(value(matches, "AWS"))
        .arch(value(matches, "ARCH"))
        .artifact(value(matches, "ARTIFACT"))
        .port_prefix(value(matches, "PORT_PREFIX"))
        .baud_rate(baud_rate)
        .wifi(value(matches, "SSID"), value(matches, "PASSPHRASE"))
        .thing_group(
            value(matches, "THING_GROUP"),
            matches.value_of("THING_GROUP_ARN").map(String::from),
        )
        .tool_timeout(Duration::from_secs(tool_timeout))
        .show_tool_output(matches.is_present("SHOW_TOOL_OUTPUT"));

    // Arguments with NO default values ========================================

    if let Some(path) = matches.value_of("STATE_FILE") {
        builder = builder.state_file(path);
    }
    if let Some(path) = matches.value_of("DEVICE_TTY") {
        builder = builder.device(path);
    }
    if let Some(region) = matches.value_of("REGION") {
        builder = builder.region(region);
    }
    if let Some(profile) = matches.value_of("PROFILE") {
        builder = builder.profile(profile);
    }

    builder.finalize()
}

/// The value of an argument that has a default value or is required, so clap
/// guarantees it is present.
fn value<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.value_of(name).unwrap_or_default()
}

fn not_a_number(matches: &ArgMatches, name: &str, flag: &str) -> ! {
    println!(
        "{}: `{}` needs to be a numeric value",
        style("error").red(),
        style(flag).cyan()
    );
    println!(
        "   {} `{}` is not a valid value",
        style("-->").cyan(),
        style(value(matches, name)).on_red()
    );
    process::exit(1);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn debug_printed_settings_hide_the_passphrase() {
    let matches = cli().get_matches_from(vec![
        "mosprov",
        "--ssid=workshop",
        "--passphrase=hunter2",
    ]);
    let settings = settings_from(&matches);
    assert_eq!(settings.wifi.ssid, "workshop");
    assert_eq!(settings.wifi.passphrase, "hunter2");
    assert!(!format!("{:#?}", settings).contains("hunter2"));
}

#[test]
fn defaults_fill_the_optional_arguments() {
    let matches = cli().get_matches_from(vec!["mosprov", "--ssid=lab", "--passphrase=x"]);
    let settings = settings_from(&matches);
    assert_eq!(settings.baud_rate, 115_200);
    assert_eq!(settings.tool_timeout, Duration::from_secs(600));
    assert!(settings.device.is_none());
}
