use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCK_FILE: &str = ".guestbridge.lock";
const RUNTIME_DIR: &str = ".guestbridge";

/// Information persisted to `.guestbridge.lock` so clients can find the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub socket_path: String,
    #[serde(default)]
    pub config_path: Option<String>,
}

impl LockInfo {
    pub fn socket_path(&self) -> &Path {
        Path::new(&self.socket_path)
    }
}

/// Where the lock file and sockets live; the current directory unless a test says otherwise.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(".")
    }
}

impl RuntimePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(RUNTIME_DIR)
    }

    pub fn allocate_socket_path(&self) -> io::Result<PathBuf> {
        let dir = self.runtime_dir();
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("guestbridge-{}.sock", Uuid::new_v4())))
    }

    pub fn read_lock(&self) -> io::Result<Option<LockInfo>> {
        let path = self.lock_file();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let info: LockInfo = serde_json::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(info))
    }

    pub fn write_lock(&self, info: &LockInfo) -> io::Result<()> {
        let path = self.lock_file();
        let tmp_path = path.with_extension("tmp");
        let contents = serde_json::to_vec(info).map_err(io::Error::other)?;
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Removes the socket and lock file, ignoring whichever is already gone.
    pub fn cleanup_lock(&self, info: &LockInfo) {
        let _ = remove_if_exists(info.socket_path());
        let _ = remove_if_exists(&self.lock_file());
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
