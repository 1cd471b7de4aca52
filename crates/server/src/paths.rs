//! Where Platewise keeps its files.
//!
//! Everything lives under one data directory: the SQLite database and a
//! `logs/` folder. The directory is chosen once in `main` and read back
//! through the helpers below.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const DATA_DIR_ENV: &str = "PLATEWISE_DATA_DIR";
const DEFAULT_DIR_NAME: &str = ".platewise";
const DB_FILE: &str = "platewise.db";
const LOGS_DIR: &str = "logs";

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// `--data-dir`, then `$PLATEWISE_DATA_DIR`, then `~/.platewise`. Without a
/// home directory the default lands under the system temp dir.
fn resolve(explicit: Option<&Path>, from_env: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or(from_env)
        .unwrap_or_else(|| home.unwrap_or_else(std::env::temp_dir).join(DEFAULT_DIR_NAME))
}

/// Fix the data directory for the rest of the process and return it.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve(
        explicit,
        std::env::var_os(DATA_DIR_ENV).map(PathBuf::from),
        dirs::home_dir(),
    );
    *DATA_DIR.write().unwrap_or_else(|e| e.into_inner()) = Some(dir.clone());
    dir
}

/// The chosen data directory; `./.platewise` before [`init_data_dir`] runs.
pub fn data_dir() -> PathBuf {
    let chosen = DATA_DIR.read().unwrap_or_else(|e| e.into_inner()).clone();
    chosen.unwrap_or_else(|| PathBuf::from(DEFAULT_DIR_NAME))
}

pub fn db_path() -> PathBuf {
    data_dir().join(DB_FILE)
}

pub fn log_dir() -> PathBuf {
    data_dir().join(LOGS_DIR)
}

pub fn ensure_dirs() -> io::Result<()> {
    // log_dir() is inside data_dir(), so this creates both.
    std::fs::create_dir_all(log_dir())
}
