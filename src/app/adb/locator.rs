use std::path::{Path, PathBuf};

use crate::app::config::ToolSettings;
use crate::app::error::AppError;

/// SDK/NDK roots, resolved once at startup by whoever hosts the library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    pub sdk_root: Option<PathBuf>,
    pub ndk_root: Option<PathBuf>,
}

impl ToolPaths {
    pub fn from_settings(settings: &ToolSettings) -> Self {
        Self {
            sdk_root: non_empty_path(&settings.sdk_root),
            ndk_root: non_empty_path(&settings.ndk_root),
        }
    }

    /// Settings first, then the usual Android environment variables.
    pub fn from_settings_or_env(settings: &ToolSettings) -> Self {
        let mut paths = Self::from_settings(settings);
        if paths.sdk_root.is_none() {
            paths.sdk_root = ["ANDROID_SDK_ROOT", "ANDROID_HOME"]
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .and_then(|value| non_empty_path(&value));
        }
        if paths.ndk_root.is_none() {
            paths.ndk_root = ["ANDROID_NDK_ROOT", "ANDROID_NDK_HOME"]
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .and_then(|value| non_empty_path(&value));
        }
        paths
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let normalized = normalize_command_path(value);
    if normalized.is_empty() {
        None
    } else {
        Some(PathBuf::from(normalized))
    }
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

/// Picks the adb executable: explicit path, then `<sdk>/platform-tools/adb`,
/// then plain `adb` from PATH. A configured location that does not hold an
/// executable is a configuration error.
pub fn resolve_adb_program(
    settings: &ToolSettings,
    paths: &ToolPaths,
    trace_id: &str,
) -> Result<String, AppError> {
    let explicit = normalize_command_path(&settings.adb_path);
    if !explicit.is_empty() {
        validate_adb_program(&explicit).map_err(|err| AppError::config(err, trace_id))?;
        return Ok(explicit);
    }
    if let Some(sdk_root) = &paths.sdk_root {
        let candidate = sdk_root.join("platform-tools").join(adb_file_name());
        let candidate = candidate.to_string_lossy().to_string();
        validate_adb_program(&candidate).map_err(|err| {
            AppError::config(
                format!("{err} (derived from SDK root {})", sdk_root.display()),
                trace_id,
            )
        })?;
        return Ok(candidate);
    }
    Ok("adb".to_string())
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err(format!("ADB executable not found at {program}"));
    }
    Ok(())
}
