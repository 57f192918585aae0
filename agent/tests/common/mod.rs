use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

/// Working directory of a test, with a pipeline file.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Prepares a command that runs the agent with the given pipeline and no config file.
    pub fn agent(&self, pipeline: &Path) -> Command {
        let mut cmd = agent();
        cmd.current_dir(self.path())
            .arg("--config")
            .arg(self.path().join("missing.toml"))
            .arg("--pipeline")
            .arg(pipeline)
            .arg("--data-dir")
            .arg(self.path().join("data"));
        cmd
    }
}

pub fn agent() -> Command {
    let mut cmd = Command::cargo_bin("flowd-agent").unwrap();
    cmd.env_remove("FLOWD_CONFIG").env("RUST_LOG", "warn");
    cmd
}
