//! Durable copy of the last snapshot payload.
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Reads and atomically replaces the backup file.
///
/// Writes go to `<path>.tmp-<pid>-<seq>` and are renamed over `path`, so readers never see a
/// partial file and cooperating processes (or threads) sharing the path never write into each
/// other's temp file. The last rename wins.
///
/// Neither operation fails: errors are logged and reported as "nothing saved" / "nothing read".
#[derive(Debug, Clone)]
pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    /// Create a store for the backup file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> BackupStore {
        BackupStore { path: path.into() }
    }

    /// Location of the backup file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the backup with `data`. Returns whether the backup was written.
    pub fn save(&self, data: &str) -> bool {
        log::debug!(target: "flagsync", path:? = self.path; "saving backup file");

        match self.write_atomically(data) {
            Ok(()) => true,
            Err(err) => {
                log::error!(target: "flagsync", path:? = self.path;
                            "unable to save backup file: {err}");
                false
            }
        }
    }

    /// Contents of the backup file, or `None` when it is missing or unreadable.
    pub fn read(&self) -> Option<String> {
        log::debug!(target: "flagsync", path:? = self.path; "reading backup file");

        match fs::read_to_string(&self.path) {
            Ok(data) => Some(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                log::error!(target: "flagsync", path:? = self.path;
                            "unable to read backup file: {err}");
                None
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        PathBuf::from(name)
    }

    fn write_atomically(&self, data: &str) -> io::Result<()> {
        let temp_path = self.temp_path();

        let result = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(data.as_bytes())?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&temp_path, &self.path));

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}
