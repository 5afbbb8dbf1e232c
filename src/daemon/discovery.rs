//! Working-directory resolution for the client
//!
//! Order of precedence:
//! 1. an explicit session file (`--session-file` or `ASK_SESSION_FILE`);
//! 2. the project registry, keyed by the project hash of the current
//!    directory or one of its ancestors;
//! 3. the session file found in the current directory or an ancestor, or
//!    the current directory itself.
//!
//! Registry-only mode stops after step 2 and fails closed.

use crate::config::ClientSettings;
use crate::error::{AskError, Result};
use crate::persist;
use crate::provider::ProviderSpec;
use crate::session::{find_session_file, project_hash};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the working directory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Explicit,
    Registry,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkDirResolution {
    pub work_dir: PathBuf,
    pub session_file: Option<PathBuf>,
    pub source: ResolutionSource,
}

/// One registry record: a project and the session file bound to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub work_dir: String,
    #[serde(default)]
    pub session_files: std::collections::HashMap<String, String>,
}

/// Default registry location: `<cache dir>/askd/registry`
pub fn default_registry_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("askd")
        .join("registry")
}

pub fn registry_path(registry_dir: &Path, work_dir: &Path) -> PathBuf {
    registry_dir.join(format!("{}.json", project_hash(work_dir)))
}

/// Record `session_file` as the provider's session for `work_dir`
pub fn register_session(
    registry_dir: &Path,
    spec: &ProviderSpec,
    work_dir: &Path,
    session_file: &Path,
) -> Result<()> {
    let path = registry_path(registry_dir, work_dir);
    let mut entry = persist::read_json::<RegistryEntry>(&path)
        .ok()
        .flatten()
        .unwrap_or_else(|| RegistryEntry {
            work_dir: work_dir.display().to_string(),
            session_files: Default::default(),
        });
    entry
        .session_files
        .insert(spec.name.clone(), session_file.display().to_string());
    persist::write_json(&path, &entry)
}

fn lookup_registry(registry_dir: &Path, spec: &ProviderSpec, cwd: &Path) -> Option<WorkDirResolution> {
    for dir in cwd.ancestors() {
        let path = registry_path(registry_dir, dir);
        let Ok(Some(entry)) = persist::read_json::<RegistryEntry>(&path) else {
            continue;
        };
        debug!(registry = %path.display(), work_dir = %entry.work_dir, "registry hit");
        return Some(WorkDirResolution {
            work_dir: PathBuf::from(&entry.work_dir),
            session_file: entry.session_files.get(&spec.name).map(PathBuf::from),
            source: ResolutionSource::Registry,
        });
    }
    None
}

/// Hosts where relative paths are unreliable (WSL, or forced by config)
pub fn is_restricted_host(settings: &ClientSettings) -> bool {
    settings.restricted_host.unwrap_or_else(detect_wsl)
}

fn detect_wsl() -> bool {
    if std::env::var_os("WSL_DISTRO_NAME").is_some() {
        return true;
    }
    fs::read_to_string("/proc/version")
        .map(|v| v.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

/// Check an explicit session file path and return it absolute
pub fn validate_session_file(
    spec: &ProviderSpec,
    path: &Path,
    cwd: &Path,
    restricted: bool,
) -> Result<PathBuf> {
    let invalid = |reason: &str| AskError::InvalidSessionFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if restricted && !path.is_absolute() {
        return Err(invalid("path must be absolute on this host"));
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name != spec.session_filename {
        return Err(invalid(&format!("expected a file named {}", spec.session_filename)));
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    if !absolute.is_file() {
        return Err(invalid("file does not exist"));
    }
    Ok(absolute)
}

/// Work out which directory (and session file) a request targets
pub fn resolve_work_dir(
    spec: &ProviderSpec,
    settings: &ClientSettings,
    explicit: Option<&Path>,
    cwd: &Path,
    registry_dir: &Path,
) -> Result<WorkDirResolution> {
    if let Some(path) = explicit.or(settings.session_file.as_deref()) {
        let session_file = validate_session_file(spec, path, cwd, is_restricted_host(settings))?;
        let work_dir = session_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());
        return Ok(WorkDirResolution {
            work_dir,
            session_file: Some(session_file),
            source: ResolutionSource::Explicit,
        });
    }

    if let Some(resolution) = lookup_registry(registry_dir, spec, cwd) {
        return Ok(resolution);
    }

    if settings.registry_only {
        return Err(AskError::SessionNotFound {
            provider: spec.name.clone(),
            work_dir: cwd.to_path_buf(),
        });
    }

    let session_file = find_session_file(spec, cwd);
    let work_dir = session_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());
    Ok(WorkDirResolution {
        work_dir,
        session_file,
        source: ResolutionSource::Local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn codex() -> ProviderSpec {
        ProviderSpec::for_name("codex")
    }

    fn settings() -> ClientSettings {
        ClientSettings {
            restricted_host: Some(false),
            ..ClientSettings::default()
        }
    }

    #[test]
    fn test_explicit_session_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join(".codex-session");
        fs::write(&file, "{}").unwrap();
        let registry = dir.path().join("registry");

        let resolved = resolve_work_dir(&codex(), &settings(), Some(&file), Path::new("/"), &registry).unwrap();
        assert_eq!(resolved.source, ResolutionSource::Explicit);
        assert_eq!(resolved.work_dir, dir.path());
        assert_eq!(resolved.session_file, Some(file));
    }

    #[test]
    fn test_explicit_wrong_filename_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join(".gemini-session");
        fs::write(&file, "{}").unwrap();
        let err = resolve_work_dir(&codex(), &settings(), Some(&file), dir.path(), dir.path()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_SESSION_FILE");
    }

    #[test]
    fn test_relative_path_rejected_on_restricted_host() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".codex-session"), "{}").unwrap();
        let restricted = ClientSettings {
            restricted_host: Some(true),
            ..ClientSettings::default()
        };
        let relative = Path::new(".codex-session");
        assert!(resolve_work_dir(&codex(), &restricted, Some(relative), dir.path(), dir.path()).is_err());
        let ok = resolve_work_dir(&codex(), &settings(), Some(relative), dir.path(), dir.path()).unwrap();
        assert_eq!(ok.work_dir, dir.path());
    }

    #[test]
    fn test_registry_lookup_from_subdirectory() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        let nested = project.join("src");
        fs::create_dir_all(&nested).unwrap();
        let registry = dir.path().join("registry");
        let session = project.join(".codex-session");
        register_session(&registry, &codex(), &project, &session).unwrap();

        let resolved = resolve_work_dir(&codex(), &settings(), None, &nested, &registry).unwrap();
        assert_eq!(resolved.source, ResolutionSource::Registry);
        assert_eq!(resolved.work_dir, project);
        assert_eq!(resolved.session_file, Some(session));
    }

    #[test]
    fn test_registry_only_fails_closed() {
        let dir = TempDir::new().unwrap();
        let strict = ClientSettings {
            registry_only: true,
            ..settings()
        };
        let err = resolve_work_dir(&codex(), &strict, None, dir.path(), &dir.path().join("registry")).unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn test_local_fallback_uses_session_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join(".codex-session"), "{}").unwrap();

        let resolved = resolve_work_dir(&codex(), &settings(), None, &nested, &dir.path().join("registry")).unwrap();
        assert_eq!(resolved.source, ResolutionSource::Local);
        assert_eq!(resolved.work_dir, dir.path());

        let empty = TempDir::new().unwrap();
        let bare = resolve_work_dir(&codex(), &settings(), None, empty.path(), &dir.path().join("registry")).unwrap();
        assert_eq!(bare.work_dir, empty.path());
        assert!(bare.session_file.is_none());
    }
}
