//! The radio daemon: waits for ANT-FS devices to come into range and syncs
//! their FIT files into local storage. Runs forever, rebuilding the radio
//! session after transient USB or protocol failures.
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use fit_sync::antfs::SyncEngine;
use fit_sync::message;
use fit_sync::pidlock::PidLock;
use fit_sync::store::Store;
use fit_sync::usb::BulkTransport;
use fit_sync::{ControlPort, Error, Radio, ANTFS_NETWORK_KEY};

const PID_FILE: &str = "/run/fit-sync/fit-sync-ant.pid";
const LOG_FILE: &str = "fit-sync-ant.log";

#[derive(Debug, Parser)]
#[command(name = "fit-sync-ant", about = "Sync FIT files from ANT-FS devices")]
struct Args {
    /// Detach from the terminal and log to a file under the storage root.
    #[arg(short = 'd')]
    daemon: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.daemon {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("failed to daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The logger may not be up yet; say it both ways.
            error!("{e}");
            eprintln!("fit-sync-ant: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> fit_sync::Result<()> {
    let mut store = Store::open_default()?;
    init_logging(args.daemon, store.root())?;
    let _lock = PidLock::acquire(Path::new(PID_FILE))?;
    sync_loop(&mut store)
}

fn init_logging(daemon: bool, root: &Path) -> fit_sync::Result<()> {
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info);
    let dispatch = if daemon {
        dispatch.chain(fern::log_file(root.join(LOG_FILE))?)
    } else {
        dispatch.chain(std::io::stderr())
    };
    dispatch
        .apply()
        .map_err(|e| Error::Io(io::Error::other(e)))?;
    Ok(())
}

fn sync_loop(store: &mut Store) -> fit_sync::Result<()> {
    let mut ctx = rusb::Context::new()?;
    loop {
        let mut radio = match Radio::open(&mut ctx) {
            Ok(radio) => radio,
            Err(e @ Error::RadioNotFound) => {
                // Nothing to wait for; let the service manager decide
                // whether to relaunch when a radio is plugged in.
                return Err(e);
            }
            Err(e) => {
                error!("opening ANT radio: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        info!(
            "ANT radio: serial# {}, version {}, max {} networks, max {} channels",
            radio.serial_number(),
            radio.version(),
            radio.max_networks(),
            radio.max_channels()
        );
        if let Err(e) = radio.set_network_key(&ANTFS_NETWORK_KEY) {
            error!("setting network key: {e}");
            continue;
        }
        if let Err(e) = run_sessions(&mut radio, store) {
            error!("{e}");
        }
        // Rebuild the radio from scratch; transient USB failures clear up
        // after a reset.
    }
}

/// Run back-to-back sync sessions on channel 0 until something fails. Each
/// session serves one device from search to disconnect.
fn run_sessions<D: BulkTransport>(radio: &mut Radio<D>, store: &mut Store) -> fit_sync::Result<()> {
    loop {
        let mut engine = SyncEngine::start(radio)?;
        if let Err(e) = pump(radio, store, &mut engine) {
            engine.shutdown(radio);
            return Err(e);
        }
    }
}

fn pump<D: BulkTransport>(
    radio: &mut Radio<D>,
    store: &mut Store,
    engine: &mut SyncEngine,
) -> fit_sync::Result<()> {
    while engine.is_open() {
        let Some(frame) = radio.tick()? else {
            continue;
        };
        if message::frame_channel(&frame) == engine.channel_number() {
            engine.handle_frame(radio, store, &frame)?;
        } else {
            log::debug!("frame for an unconfigured channel: {frame:02x?}");
        }
    }
    Ok(())
}
