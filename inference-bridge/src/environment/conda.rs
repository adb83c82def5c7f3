//! conda-specific sources: the `environments.txt` registry, the output of
//! `conda env list`, and the conventional install locations.

use std::path::{Path, PathBuf};

/// Name conda gives its root environment
pub const ROOT_ENV_NAME: &str = "base";

/// Environment name for an environment root directory.
///
/// Named environments live in `<install>/envs/<name>`; any other root is the
/// install's own root environment.
pub fn env_name_from_root(root: &Path) -> Option<String> {
    let name = root.file_name()?.to_string_lossy().into_owned();
    let parent_is_envs = root
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|p| p.to_string_lossy().eq_ignore_ascii_case("envs"));
    if parent_is_envs {
        Some(name)
    } else {
        Some(ROOT_ENV_NAME.to_string())
    }
}

/// Environment roots listed in the registry file, one per line
pub fn parse_registry(text: &str) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

/// Byte offset where an absolute path starts in a `conda env list` row
fn path_start(row: &str) -> Option<usize> {
    let bytes = row.as_bytes();
    (0..bytes.len()).find(|&i| {
        let at_token_start = i == 0 || bytes[i - 1].is_ascii_whitespace();
        if !at_token_start {
            return false;
        }
        let posix = bytes[i] == b'/';
        let unc = bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'\\');
        let drive = bytes[i].is_ascii_alphabetic()
            && bytes.get(i + 1) == Some(&b':')
            && matches!(bytes.get(i + 2), Some(b'\\' | b'/'));
        posix || unc || drive
    })
}

/// Parse `conda env list` output into `(name, root)` pairs.
///
/// Rows look like `name  [*]  /path/to/env`; the active environment is
/// marked with `*`. Unnamed environments (created with `--prefix`) print
/// only the path and are named after their directory.
pub fn parse_env_list(output: &str) -> Vec<(String, PathBuf)> {
    let mut envs = Vec::new();
    for line in output.lines() {
        let row = line.trim();
        if row.is_empty() || row.starts_with('#') {
            continue;
        }
        let Some(start) = path_start(row) else {
            continue;
        };
        let root = PathBuf::from(row[start..].trim());
        let label = row[..start].trim().trim_end_matches('*').trim();
        let name = if label.is_empty() {
            root.file_name().map(|n| n.to_string_lossy().into_owned())
        } else {
            Some(label.to_string())
        };
        if let Some(name) = name {
            envs.push((name, root));
        }
    }
    envs
}

/// `envs/` directories of the usual conda installs under `home`
pub fn fallback_env_dirs(home: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = [
        "miniconda3",
        "anaconda3",
        "Miniconda3",
        "Anaconda3",
        "miniforge3",
        "mambaforge",
        ".conda",
    ]
    .iter()
    .map(|install| home.join(install).join("envs"))
    .collect();

    if cfg!(windows) {
        dirs.push(PathBuf::from("C:/ProgramData/miniconda3/envs"));
        dirs.push(PathBuf::from("C:/ProgramData/anaconda3/envs"));
    } else {
        dirs.push(PathBuf::from("/opt/conda/envs"));
        dirs.push(PathBuf::from("/opt/miniconda3/envs"));
    }
    dirs
}
