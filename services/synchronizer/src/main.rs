//! Stand-alone synchronization coordinator.
//!
//! Runs the central barrier in server mode, or a self-contained test client
//! that simulates its granted slices with wall-clock sleeps.

use clap::{App, Arg};
use fabric::config::{Config, Mode};
use fabric::coordinator::Coordinator;
use fabric::frame::ClientKind;
use fabric::logging;
use fabric::session::Session;
use fabric::time::elapsed_micros;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    let matches = App::new("Synchronizer")
        .version("1.0")
        .about("Barrier-based time synchronization coordinator.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::with_name("MODE")
                .help("Overrides GENERAL.mode from the config file")
                .possible_values(&["server", "client"]),
        )
        .arg(
            Arg::with_name("periods")
                .long("periods")
                .takes_value(true)
                .help("Client mode: number of slices to simulate before unregistering (0 = run forever)"),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    let log = logging::init();

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            logging::crit!(log, "failed to load configuration";
                           "path" => config_path,
                           "error" => ?err);
            process::exit(1);
        }
    };

    let mode = match matches.value_of("MODE") {
        Some("server") => Mode::Server,
        Some("client") => Mode::Client,
        _ => config.general.mode,
    };

    let periods: u64 = match matches.value_of("periods").unwrap_or("0").parse() {
        Ok(periods) => periods,
        Err(_) => {
            logging::crit!(log, "--periods must be a number");
            process::exit(1);
        }
    };

    let exit_code = match mode {
        Mode::Server => run_server(&config, &log),
        Mode::Client => run_client(&config, periods, &log),
    };

    process::exit(exit_code);
}

fn run_server(config: &Config, log: &logging::Logger) -> i32 {
    let mut coordinator = match Coordinator::bind(&config.server, log) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            logging::crit!(log, "failed to bind coordinator socket"; "error" => ?err);
            return 1;
        }
    };

    match coordinator.run() {
        Ok(()) => 0,
        Err(err) => {
            logging::crit!(log, "coordinator failed"; "error" => ?err);
            1
        }
    }
}

/// Test client: registers, sleeps each granted slice in wall-clock time and
/// reports the finish. Useful for exercising a coordinator deployment
/// without a simulator attached.
fn run_client(config: &Config, periods: u64, log: &logging::Logger) -> i32 {
    let mut session = match Session::new(&config.client, ClientKind::Test, log) {
        Ok(session) => session,
        Err(err) => {
            logging::crit!(log, "failed to create session"; "error" => ?err);
            return 1;
        }
    };

    if let Err(err) = session.connect_and_register() {
        logging::crit!(log, "failed to register at coordinator"; "error" => ?err);
        return 1;
    }

    let mut completed: u64 = 0;
    while periods == 0 || completed < periods {
        let run_time = match session.wait_for_run_permission() {
            Ok(run_time) => run_time,
            Err(err) => {
                logging::crit!(log, "wait for run permission failed"; "error" => ?err);
                return 1;
            }
        };

        logging::debug!(log, "simulating slice";
                        "period" => session.period(),
                        "run_time" => run_time);

        let started = Instant::now();
        thread::sleep(Duration::from_micros(u64::from(run_time)));

        if let Err(err) = session.send_finished(run_time, elapsed_micros(started)) {
            logging::crit!(log, "failed to report finished"; "error" => ?err);
            return 1;
        }

        completed += 1;
    }

    logging::info!(log, "client done"; "periods" => completed);

    if let Err(err) = session.unregister_and_disconnect() {
        logging::crit!(log, "failed to unregister"; "error" => ?err);
        return 1;
    }

    0
}
