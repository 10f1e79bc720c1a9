//! The falterd binary.
//!
//! Flag handling, config-file loading, privilege checks and
//! daemonisation live here; everything interesting is in the library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;
use log::info;
use log::warn;

use falter::Config;
use falter::Daemon;
use falter::config::DEFAULT_CONFIG_FILE;

#[derive(Debug, Parser)]
#[command(name = "falterd", version, about = "File alteration monitoring daemon")]
struct Args {
    /// Stay in the foreground
    #[arg(short = 'f')]
    foreground: bool,

    /// Log at debug level
    #[arg(short = 'd')]
    debug: bool,

    /// Log at info level
    #[arg(short = 'v')]
    verbose: bool,

    /// Disable polling of remote hosts
    #[arg(short = 'l')]
    no_remote_polling: bool,

    /// Polling interval in seconds
    #[arg(short = 't', value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Exit this many seconds after the last client disconnects
    #[arg(short = 'T', value_name = "SECONDS")]
    idle_timeout: Option<u64>,

    /// Override the RPC program number and version
    #[arg(short = 'p', value_name = "PROG.VERS")]
    program: Option<String>,

    /// Local only: refuse connections from other hosts
    #[arg(short = 'L')]
    local_only: bool,

    /// Alternate configuration file
    #[arg(short = 'c', value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Insecure compatibility: trust the uid/gid in request payloads
    #[arg(short = 'C')]
    insecure_compat: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else if args.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if !nix::unistd::getuid().is_root() {
        error!("must be superuser");
        return ExitCode::FAILURE;
    }

    let mut config = Config::default();
    let config_path = args
        .config_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if let Err(err) = config.load_file(&config_path) {
        error!("couldn't read config file {:?}: {}", config_path, err);
        return ExitCode::FAILURE;
    }

    // Command-line settings override the file.
    if args.no_remote_polling {
        config.remote_polling = false;
    }
    if let Some(secs) = args.poll_interval {
        if secs == 0 {
            error!("illegal poll interval 0");
        } else {
            config.poll_interval = std::time::Duration::from_secs(secs);
        }
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = std::time::Duration::from_secs(secs);
    }
    if args.local_only {
        config.local_only = true;
    }
    if args.insecure_compat {
        info!("running with insecure compatibility enabled");
        config.insecure_compat = true;
        config.xtab_verification = false;
    }
    if let Some(spec) = &args.program {
        match parse_program(spec) {
            Some((program, version)) => {
                config.program = program;
                config.version = version;
            }
            None => {
                error!("bad program.version \"{}\"", spec);
                return ExitCode::FAILURE;
            }
        }
    }

    if config.untrusted_user.is_none() {
        error!(
            "fatal misconfiguration: no untrusted_user in {:?}",
            config_path
        );
        return ExitCode::FAILURE;
    }

    // Daemonizing redirects the std descriptors to /dev/null; a process
    // started by a super-server must keep descriptor 0, its inherited
    // rendezvous socket, so it never daemonizes.
    let started_by_superserver = falter::listener::started_by_superserver();
    let debugging = args.foreground || args.debug || args.verbose;
    if !started_by_superserver && !debugging {
        if let Err(err) = nix::unistd::daemon(false, false) {
            error!("can't daemonize: {}", err);
            return ExitCode::FAILURE;
        }
    }
    // Broken client pipes surface as EPIPE, not a signal.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    let mut daemon = Daemon::new(config);
    if daemon.untrusted.is_none() {
        error!("untrusted_user does not name a known user");
        return ExitCode::FAILURE;
    }
    if let Err(err) = daemon.listener_init() {
        error!("{}", err);
        return ExitCode::FAILURE;
    }

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("wait failure in the scheduler: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn parse_program(spec: &str) -> Option<(u32, u32)> {
    match spec.split_once('.') {
        Some((program, version)) => Some((program.parse().ok()?, version.parse().ok()?)),
        None => {
            warn!("no version in \"{}\"; keeping the default", spec);
            Some((spec.parse().ok()?, falter::config::VERSION))
        }
    }
}
