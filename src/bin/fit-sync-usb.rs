//! The batch processor: walks a directory tree (typically a watch mounted
//! as USB mass storage), reads the FileId header out of every FIT file and
//! files a copy into the canonical storage tree. Activities only by
//! default; `-a` copies every sub-type.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info, warn};
use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

use fit_sync::antfs::directory::SUB_TYPE_ACTIVITY;
use fit_sync::fit::{self, FileId, FitVisitor, Flow};
use fit_sync::pidlock::PidLock;
use fit_sync::store::{self, Store};
use fit_sync::Error;

const DEFAULT_PID_FILE: &str = "/run/fit-sync/fit-sync-usb.pid";
const LOG_FILE: &str = "fit-sync-usb.log";

#[derive(Debug, Parser)]
#[command(
    name = "fit-sync-usb",
    about = "File FIT files from a mounted device into local storage"
)]
struct Args {
    /// PID lock file.
    #[arg(short = 'p', value_name = "PIDFILE", default_value = DEFAULT_PID_FILE)]
    pidfile: PathBuf,

    /// Copy every FIT sub-type, not just activities.
    #[arg(short = 'a')]
    all: bool,

    /// Detach from the terminal and log to a file under the storage root.
    #[arg(short = 'd')]
    daemon: bool,

    /// Directory to scan for FIT files.
    dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Resolve the directory before any chdir so the scan is unaffected by
    // the daemon working-directory switch.
    let dir = args.dir.canonicalize().unwrap_or_else(|_| args.dir.clone());

    if args.daemon {
        // Switch to the work dir first so the filesystem is not unmounted
        // from beneath us, and keep it as the daemon's cwd.
        if let Err(e) = std::env::set_current_dir(&dir) {
            eprintln!("cannot enter {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
        if let Err(e) = nix::unistd::daemon(true, false) {
            eprintln!("failed to daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    match run(&args, &dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("fit-sync-usb: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, dir: &Path) -> fit_sync::Result<()> {
    let store = Store::open_default()?;
    init_logging(args.daemon, store.root())?;
    let _lock = PidLock::acquire(&args.pidfile)?;

    info!("processing {}", dir.display());
    store::scan_fit_files(dir, |path| {
        if let Err(e) = process_fit_file(&store, path, args.all) {
            error!("{}: {e}", path.display());
        }
    })?;
    info!("sync complete");
    Ok(())
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

/// Pulls the first FileId out of a FIT file and stops decoding.
#[derive(Default)]
struct FileIdProbe {
    file_id: Option<FileId>,
}

impl FitVisitor for FileIdProbe {
    fn on_file_id(&mut self, message: &FileId) -> Flow {
        self.file_id = Some(message.clone());
        Flow::Stop
    }
}

fn process_fit_file(store: &Store, path: &Path, all_sub_types: bool) -> fit_sync::Result<()> {
    let data = fs::read(path)?;

    let mut probe = FileIdProbe::default();
    fit::read_messages(&data, &mut probe)?;
    let Some(file_id) = probe.file_id else {
        warn!("{}: no FileId message, skipping", path.display());
        return Ok(());
    };

    if !all_sub_types && file_id.file_type.0 != SUB_TYPE_ACTIVITY {
        debug!(
            "{}: sub-type {} is not an activity, skipping",
            path.display(),
            file_id.file_type.0
        );
        return Ok(());
    }

    // A FileId's type field uses the same sub-type numbering the ANT-FS
    // directory does, so both drivers agree on the target directory.
    let serial = file_id.serial_number.0;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Io(io::Error::other("path has no file name")))?;
    let target = store.file_path(serial, file_id.file_type.0)?.join(name);
    store::write_atomic(&target, &data)?;

    // Stamp the copy with the FIT creation time, so the tree reads
    // chronologically in a file browser.
    if !file_id.time_created.is_na() {
        let when = TimeVal::seconds(file_id.time_created.0 as i64);
        if let Err(e) = utimes(&target, &when, &when) {
            warn!("{}: setting file times: {e}", target.display());
        }
    }

    info!("{} went into {}", path.display(), target.display());
    Ok(())
}
