//! Project directory layout. `RIG_HOME` overrides the root; everything else
//! hangs off it.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProjectPaths { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var_os("RIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        ProjectPaths { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }

    pub fn margins_dir(&self) -> PathBuf {
        self.root.join("margins")
    }

    pub fn adapters_dir(&self) -> PathBuf {
        self.root.join("adapters")
    }

    pub fn policy_file(&self) -> PathBuf {
        self.root.join("policy").join("safety.yaml")
    }

    pub fn policy_profiles_dir(&self) -> PathBuf {
        self.root.join("policy").join("profiles")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }
}
