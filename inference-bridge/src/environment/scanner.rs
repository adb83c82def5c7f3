use futures_util::future::join_all;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{
    conda, interpreter_in, normalize_path, probe_output, probe_succeeds, EnvironmentKind,
    RuntimeEnvironment,
};
use crate::config::Timeouts;

/// Module the worker needs; probed with `import <module>`
pub const DEFAULT_REQUIRED_MODULE: &str = "ultralytics";

/// Display name of the system interpreter entry
const SYSTEM_ENV_NAME: &str = "System Python";

/// Where and how to look for interpreters
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Interpreter name resolved through the search path
    pub system_interpreter: String,
    /// Environment manager executable
    pub manager: String,
    /// Registry file the manager maintains (one environment root per line)
    pub registry_file: Option<PathBuf>,
    /// Directories whose subdirectories are environment roots
    pub fallback_dirs: Vec<PathBuf>,
    /// Module that must be importable for the worker to run
    pub required_module: String,
    pub timeouts: Timeouts,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let home = dirs::home_dir();
        Self {
            system_interpreter: default_system_interpreter().to_string(),
            manager: "conda".to_string(),
            registry_file: home
                .as_ref()
                .map(|h| h.join(".conda").join("environments.txt")),
            fallback_dirs: home
                .as_deref()
                .map(conda::fallback_env_dirs)
                .unwrap_or_default(),
            required_module: DEFAULT_REQUIRED_MODULE.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Bare interpreter name for this platform
pub(crate) fn default_system_interpreter() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Candidate list, deduplicated by normalized interpreter path
#[derive(Default)]
struct Candidates {
    seen: HashSet<PathBuf>,
    found: Vec<(String, String, EnvironmentKind)>,
}

impl Candidates {
    fn push_system(&mut self, name: &str, interpreter: &str) {
        if self.seen.insert(PathBuf::from(interpreter)) {
            self.found
                .push((name.to_string(), interpreter.to_string(), EnvironmentKind::System));
        }
    }

    fn push_isolated(&mut self, name: String, interpreter: &Path) {
        let normalized = normalize_path(interpreter);
        if !normalized.exists() {
            debug!(path = %normalized.display(), "Skipping missing interpreter");
            return;
        }
        if !self.seen.insert(normalized.clone()) {
            return;
        }
        self.found.push((
            name,
            normalized.to_string_lossy().into_owned(),
            EnvironmentKind::Isolated,
        ));
    }
}

/// Enumerates interpreters according to a [`ScanConfig`]
#[derive(Debug, Clone, Default)]
pub struct EnvironmentScanner {
    config: ScanConfig,
}

impl EnvironmentScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Discover every interpreter and probe each for the required module.
    ///
    /// Sources, in order: the system interpreter, the manager's registry
    /// file, `<manager> env list`, then the fallback directories. Results
    /// keep that order. Safe to call repeatedly.
    pub async fn scan(&self) -> Vec<RuntimeEnvironment> {
        let mut candidates = Candidates::default();
        let timeouts = &self.config.timeouts;

        let system = self.config.system_interpreter.as_str();
        if probe_succeeds(system, &["--version"], timeouts.version_probe).await {
            candidates.push_system(SYSTEM_ENV_NAME, system);
        }

        for root in self.registry_roots() {
            if let Some(name) = conda::env_name_from_root(&root) {
                candidates.push_isolated(name, &interpreter_in(&root));
            }
        }

        for (name, root) in self.manager_listed().await {
            candidates.push_isolated(name, &interpreter_in(&root));
        }

        for dir in &self.config.fallback_dirs {
            for (name, root) in subdirectories(dir) {
                candidates.push_isolated(name, &interpreter_in(&root));
            }
        }

        let import = format!("import {}", self.config.required_module);
        let args = ["-c", import.as_str()];
        let probes = candidates
            .found
            .iter()
            .map(|(_, interpreter, _)| probe_succeeds(interpreter, &args, timeouts.library_probe));
        let results = join_all(probes).await;

        let environments: Vec<RuntimeEnvironment> = candidates
            .found
            .into_iter()
            .zip(results)
            .map(|((name, interpreter_path, kind), has_required_library)| RuntimeEnvironment {
                name,
                interpreter_path,
                kind,
                has_required_library,
            })
            .collect();

        info!(
            count = environments.len(),
            usable = environments.iter().filter(|e| e.has_required_library).count(),
            "Interpreter scan complete"
        );
        environments
    }

    fn registry_roots(&self) -> Vec<PathBuf> {
        let Some(path) = &self.config.registry_file else {
            return Vec::new();
        };
        match fs::read_to_string(path) {
            Ok(text) => conda::parse_registry(&text)
                .iter()
                .map(|root| normalize_path(root))
                .collect(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No environment registry");
                Vec::new()
            }
        }
    }

    async fn manager_listed(&self) -> Vec<(String, PathBuf)> {
        probe_output(
            &self.config.manager,
            &["env", "list"],
            self.config.timeouts.manager_list,
        )
        .await
        .map(|out| conda::parse_env_list(&out))
        .unwrap_or_default()
    }
}

/// `(name, path)` of every subdirectory of `dir`, sorted by name
fn subdirectories(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut subdirs: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    subdirs.sort();
    subdirs
}
