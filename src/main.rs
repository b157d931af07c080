/*!
 * icapd - Main Entry Point
 *
 * Parses the command line, sets up logging, daemonizes unless told not
 * to, and runs either the monitor (the normal multi-process mode) or a
 * single in-process child for debugging.
 */

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use icapd::server::monitor::run_single_process;
use icapd::{Monitor, OptionsHandler, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "icapd", disable_version_flag = true)]
#[command(about = "Multi-process ICAP server")]
struct Cli {
    /// Print version; repeat for build information
    #[arg(short = 'V', action = clap::ArgAction::Count)]
    version: u8,

    /// With -V: print all build information
    #[arg(short = 'A')]
    all_build_info: bool,

    /// Configuration file (directives are handled by the outer layers)
    #[arg(short = 'f', value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Do not run as a daemon
    #[arg(short = 'N')]
    no_daemon: bool,

    /// Debug level (0 errors .. 4 trace)
    #[arg(short = 'd', value_name = "LEVEL")]
    debug_level: Option<u8>,

    /// Print debug info to stdout
    #[arg(short = 'D')]
    debug_stdout: bool,

    /// Single-process mode: no supervisor, one child's worker pool
    #[arg(short = 'S')]
    single_process: bool,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    if cli.version > 0 {
        println!("icapd {}", env!("CARGO_PKG_VERSION"));
        if cli.version > 1 || cli.all_build_info {
            println!("package: {}", env!("CARGO_PKG_NAME"));
            println!("target arch: {}", std::env::consts::ARCH);
            println!("target os: {}", std::env::consts::OS);
        }
        return 0;
    }

    init_logging(&cli);

    let config = ServerConfig::default();
    if let Some(path) = &cli.config_file {
        // Directive parsing belongs to the configuration layer; the core
        // runs on its defaults plus the command line.
        info!("configuration file {:?} noted; core uses built-in defaults", path);
    }

    let handler = Arc::new(OptionsHandler);

    if cli.single_process {
        return match run_single_process(config, handler) {
            Ok(code) => code,
            Err(e) => {
                error!("single-process server failed: {}", e);
                1
            }
        };
    }

    if !cli.no_daemon {
        if let Err(e) = daemonize() {
            eprintln!("cannot daemonize: {}", e);
            return 1;
        }
    }

    let mut monitor = match Monitor::new(config, handler) {
        Ok(m) => m,
        Err(e) => {
            error!("startup failed: {}", e);
            return 1;
        }
    };
    match monitor.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("monitor failed: {}", e);
            1
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.debug_level.unwrap_or(2) {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    if cli.debug_stdout {
        builder.target(env_logger::Target::Stdout);
    }
    builder.init();
}

/// Classic double-fork: detach from the controlling terminal, start a new
/// session and point stdio at /dev/null.
fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};
    use std::os::fd::AsRawFd;

    let to_io = |e: nix::Error| std::io::Error::from_raw_os_error(e as i32);

    match unsafe { fork() }.map_err(to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(to_io)?;
    match unsafe { fork() }.map_err(to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), fd).map_err(to_io)?;
    }
    Ok(())
}
