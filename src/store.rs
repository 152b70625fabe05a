//! Local storage for synced devices. Everything lives under one root
//! (`$HOME/FitSync` by default): a directory per device serial, sub-type
//! directories under it, the device's authentication key, and the
//! human-readable directory listing captured on each sync.
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::warn;

use crate::{error::Error, Result};

const APP_DIR: &str = "FitSync";
const KEY_FILE: &str = "auth_key.dat";
const FILE_LIST: &str = "file_list.txt";

/// Handle to the storage tree plus the in-memory sync clock. One instance
/// lives for the whole process; the sync clock is not persisted.
pub struct Store {
    root: PathBuf,
    last_sync: HashMap<u32, i64>,
}

impl Store {
    /// Open the default storage root under the user's home directory,
    /// creating it on first use.
    pub fn open_default() -> Result<Store> {
        let home = std::env::var_os("HOME").ok_or(Error::NoHomeDirectory)?;
        Store::open(Path::new(&home).join(APP_DIR))
    }

    pub fn open(root: PathBuf) -> Result<Store> {
        fs::create_dir_all(&root)?;
        Ok(Store {
            root,
            last_sync: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-device directory, created lazily.
    pub fn device_path(&self, serial: u32) -> Result<PathBuf> {
        let path = self.root.join(serial.to_string());
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Directory a file of the given sub-type belongs in, created lazily.
    pub fn file_path(&self, serial: u32, sub_type: u8) -> Result<PathBuf> {
        let path = self
            .root
            .join(serial.to_string())
            .join(sub_type_dir(sub_type));
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn put_key(&self, serial: u32, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        write_atomic(&self.device_path(serial)?.join(KEY_FILE), key)
    }

    /// Stored key for a device, empty when there is none. All read errors
    /// are treated as "no key"; the worst case is a fresh pairing request.
    pub fn get_key(&self, serial: u32) -> Vec<u8> {
        let path = self.root.join(serial.to_string()).join(KEY_FILE);
        fs::read(path).unwrap_or_default()
    }

    pub fn remove_key(&self, serial: u32) -> Result<()> {
        let path = self.root.join(serial.to_string()).join(KEY_FILE);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_successful_sync(&mut self, serial: u32) {
        self.last_sync.insert(serial, Utc::now().timestamp());
    }

    /// Unix seconds of the last successful sync, 0 if the device has not
    /// synced since the process started.
    pub fn last_successful_sync(&self, serial: u32) -> i64 {
        self.last_sync.get(&serial).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_last_sync(&mut self, serial: u32, when: i64) {
        self.last_sync.insert(serial, when);
    }

    pub fn write_file_list(&self, serial: u32, contents: &str) -> Result<()> {
        fs::write(self.device_path(serial)?.join(FILE_LIST), contents)?;
        Ok(())
    }
}

/// Write `data` to `path` atomically: write `<path>.tmp`, then rename over
/// the target, so readers never observe a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Map a FIT file sub-type to the directory it is stored under.
pub fn sub_type_dir(sub_type: u8) -> &'static str {
    use crate::antfs::directory::*;
    match sub_type {
        SUB_TYPE_DEVICE => ".",
        SUB_TYPE_SETTING => "Settings",
        SUB_TYPE_SPORT | SUB_TYPE_MULTISPORT => "Sports",
        SUB_TYPE_ACTIVITY | SUB_TYPE_ACTIVITY_SUMMARY => "Activities",
        SUB_TYPE_WORKOUT => "Workouts",
        SUB_TYPE_COURSE => "Courses",
        SUB_TYPE_SCHEDULES => "Schedules",
        SUB_TYPE_WEIGHT => "Weight",
        SUB_TYPE_TOTALS => "Totals",
        SUB_TYPE_GOALS => "Goals",
        SUB_TYPE_BLOOD_PRESSURE => "Blood Pressure",
        SUB_TYPE_MONITORING_A | SUB_TYPE_MONITORING_DAILY | SUB_TYPE_MONITORING_B => "Monitoring",
        _ => "Unknown",
    }
}

/// Breadth-first walk of `root`, invoking the handler for every regular
/// file with a `.fit` extension (case-insensitive). Errors below the root
/// are logged and skipped so one unreadable directory does not abort the
/// whole scan.
pub fn scan_fit_files(root: &Path, mut handler: impl FnMut(&Path)) -> Result<()> {
    let mut pending = VecDeque::new();
    pending.push_back(root.to_path_buf());
    while let Some(dir) = pending.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e.into()),
            Err(e) => {
                warn!("{}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}: {}", dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!("{}: {}", path.display(), e);
                    continue;
                }
            };
            if file_type.is_dir() {
                pending.push_back(path);
            } else if file_type.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("fit"))
            {
                handler(&path);
            }
        }
    }
    Ok(())
}

/// Devices we refuse to sync with by `(manufacturer, device)` pair. The
/// Garmin Vector pedals keep trying to connect even though they never have
/// activities to download, draining their battery.
pub fn is_blacklisted_device(manufacturer: u16, device: u16) -> bool {
    manufacturer == 1 && (device == 1381 || device == 2161)
}

/// Per-serial blacklist. Nothing is listed today; the sync engine consults
/// it before pairing.
pub fn is_blacklisted_serial(_serial: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let dir = temp_dir("atomic");
        let target = dir.join("out.bin");
        write_atomic(&target, b"hello").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
        assert!(!dir.join("out.bin.tmp").exists());
        // Overwrite goes through the same path.
        write_atomic(&target, b"world").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"world");
    }

    #[test]
    fn sub_type_directories() {
        assert_eq!(sub_type_dir(1), ".");
        assert_eq!(sub_type_dir(3), "Sports");
        assert_eq!(sub_type_dir(33), "Sports");
        assert_eq!(sub_type_dir(4), "Activities");
        assert_eq!(sub_type_dir(20), "Activities");
        assert_eq!(sub_type_dir(14), "Blood Pressure");
        assert_eq!(sub_type_dir(15), "Monitoring");
        assert_eq!(sub_type_dir(28), "Monitoring");
        assert_eq!(sub_type_dir(32), "Monitoring");
        assert_eq!(sub_type_dir(200), "Unknown");
    }

    #[test]
    fn key_round_trip() {
        let store = Store::open(temp_dir("keys")).unwrap();
        assert!(store.get_key(7).is_empty());
        store.put_key(7, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.get_key(7), vec![1, 2, 3, 4]);
        // Empty keys are not persisted.
        store.put_key(8, &[]).unwrap();
        assert!(store.get_key(8).is_empty());
        store.remove_key(7).unwrap();
        assert!(store.get_key(7).is_empty());
        // Removing twice is fine.
        store.remove_key(7).unwrap();
    }

    #[test]
    fn sync_clock_defaults_to_epoch() {
        let mut store = Store::open(temp_dir("clock")).unwrap();
        assert_eq!(store.last_successful_sync(9), 0);
        store.mark_successful_sync(9);
        let now = Utc::now().timestamp();
        assert!((now - store.last_successful_sync(9)).abs() < 5);
    }

    #[test]
    fn file_paths_are_created_lazily() {
        let store = Store::open(temp_dir("paths")).unwrap();
        let path = store.file_path(123, 4).unwrap();
        assert!(path.ends_with("123/Activities"));
        assert!(path.is_dir());
    }

    #[test]
    fn scan_finds_fit_files_breadth_first() {
        let dir = temp_dir("scan");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        fs::write(dir.join("one.FIT"), b"x").unwrap();
        fs::write(dir.join("skip.txt"), b"x").unwrap();
        fs::write(dir.join("a/two.fit"), b"x").unwrap();
        fs::write(dir.join("a/b/three.Fit"), b"x").unwrap();
        let mut found = Vec::new();
        scan_fit_files(&dir, |p| {
            found.push(p.file_name().unwrap().to_string_lossy().into_owned())
        })
        .unwrap();
        assert_eq!(found, vec!["one.FIT", "two.fit", "three.Fit"]);
    }

    #[test]
    fn device_blacklist() {
        assert!(is_blacklisted_device(1, 1381));
        assert!(is_blacklisted_device(1, 2161));
        assert!(!is_blacklisted_device(1, 1382));
        assert!(!is_blacklisted_device(2, 1381));
        assert!(!is_blacklisted_serial(0xDEADBEEF));
    }
}
