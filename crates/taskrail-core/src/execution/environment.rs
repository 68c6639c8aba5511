use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[cfg(windows)]
const DEFAULT_PATH_VARIABLE: &str = "Path";
#[cfg(not(windows))]
const DEFAULT_PATH_VARIABLE: &str = "PATH";

/// Where executables are looked up and what every spawned process inherits.
///
/// An empty `search_path` means "use the current process's path variable".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessEnvironment {
    pub search_path: Vec<PathBuf>,
    pub path_variable: String,
    pub default_working_dir: Option<PathBuf>,
    pub variables: BTreeMap<String, String>,
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self {
            search_path: Vec::new(),
            path_variable: DEFAULT_PATH_VARIABLE.to_string(),
            default_working_dir: None,
            variables: BTreeMap::new(),
        }
    }
}

impl ProcessEnvironment {
    /// Snapshot of the current process's search path.
    pub fn from_system() -> Self {
        let mut environment = Self::default();
        environment.search_path = std::env::var_os(&environment.path_variable)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        environment
    }

    pub fn with_search_path(mut self, directories: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.search_path = directories.into_iter().map(Into::into).collect();
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Resolves `program` to an executable file.
    ///
    /// Names with a directory component are checked as given; bare names are looked up
    /// in the search path in order.
    pub fn resolve_executable(&self, program: &Path) -> Option<PathBuf> {
        if program.components().count() > 1 || program.is_absolute() {
            return is_executable(program).then(|| program.to_path_buf());
        }

        self.directories()
            .into_iter()
            .flat_map(|directory| candidates(&directory, program))
            .find(|candidate| is_executable(candidate))
    }

    /// Value exported through `path_variable` to spawned processes, if overridden.
    pub(crate) fn exported_path(&self) -> Option<OsString> {
        if self.search_path.is_empty() {
            return None;
        }
        std::env::join_paths(&self.search_path).ok()
    }

    fn directories(&self) -> Vec<PathBuf> {
        if !self.search_path.is_empty() {
            return self.search_path.clone();
        }
        std::env::var_os(&self.path_variable)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default()
    }
}

#[cfg(windows)]
fn candidates(directory: &Path, program: &Path) -> Vec<PathBuf> {
    let plain = directory.join(program);
    if plain.extension().is_some() {
        return vec![plain];
    }
    vec![plain.with_extension("exe"), plain.with_extension("cmd"), plain]
}

#[cfg(not(windows))]
fn candidates(directory: &Path, program: &Path) -> Vec<PathBuf> {
    vec![directory.join(program)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
