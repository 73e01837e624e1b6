use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::PluginConfig;

pub const DB_RELATIVE_PATH: &str = "data/meta/struct.sqlite3";
pub const CONFIG_RELATIVE_PATH: &str = "conf/structcombolookup.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub wiki_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub wiki_root: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub db_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub wiki_root_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "wiki_root={} ({})\ndb_path={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.wiki_root),
            self.root_source.as_str(),
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    /// Let `[store] db_path` replace the default location; flag and env still win.
    pub fn apply_config(&mut self, config: &PluginConfig) {
        if self.db_source != ValueSource::Default {
            return;
        }
        if let Some(db_path) = config.db_path() {
            self.db_path = absolutize(Path::new(db_path), &self.wiki_root);
            self.db_source = ValueSource::Config;
        }
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let wiki_root_exists = paths.wiki_root.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !db_exists {
        warnings.push(format!(
            "struct database is missing at {}; is the struct plugin installed?",
            normalize_for_display(&paths.db_path)
        ));
    }
    if !wiki_root_exists {
        warnings.push("wiki root does not exist; pass --wiki-root".to_string());
    }

    Ok(RuntimeStatus {
        wiki_root_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (wiki_root, root_source) = resolve_wiki_root(context, overrides, &lookup_env);

    let (db_path, db_source) = if let Some(path) = overrides.db_path.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("STRUCT_DB_PATH")) {
        (
            absolutize(Path::new(&value), &wiki_root),
            ValueSource::Env,
        )
    } else {
        (wiki_root.join(DB_RELATIVE_PATH), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("STRUCTCOMBOLOOKUP_CONFIG")) {
        (
            absolutize(Path::new(&value), &wiki_root),
            ValueSource::Env,
        )
    } else {
        (wiki_root.join(CONFIG_RELATIVE_PATH), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        wiki_root,
        db_path,
        config_path,
        root_source,
        db_source,
        config_source,
    })
}

fn resolve_wiki_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.wiki_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_empty(lookup_env("STRUCT_WIKI_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    let root = detect_wiki_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

fn detect_wiki_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join("doku.php").exists() || candidate.join(DB_RELATIVE_PATH).exists() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cwd.ancestors().map(Path::to_path_buf).collect();
    if let Some(exe_dir) = executable_dir {
        out.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
