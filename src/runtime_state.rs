use std::path::{Path, PathBuf};

pub const RECOVERY_FILE_NAME: &str = ".tunnel-info";

#[derive(Clone, Debug)]
pub struct RuntimePaths {
    work_dir: PathBuf,
    state_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(work_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Paths rooted at `work_dir`, with state kept in `<work_dir>/state`.
    pub fn for_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let state_dir = work_dir.join("state");
        Self::new(work_dir, state_dir)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Lives in the working directory itself, outside `state/`.
    pub fn recovery_path(&self) -> PathBuf {
        self.work_dir.join(RECOVERY_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join("launcher.yaml")
    }
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Removes `path`; a missing file is not an error.
pub fn remove_if_exists(path: &Path) -> anyhow::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub fn read_text(path: &Path) -> anyhow::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(std::fs::read_to_string(path)?))
}
