use std::fs;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};

use crate::app::adb::client::{device_args, Adb};
use crate::app::adb::paths::remote_capture_path;
use crate::app::config::ScreenshotSettings;
use crate::app::error::AppError;

/// The last decoded screenshot and the device it came from.
pub struct HeldScreenshot {
    pub serial: String,
    pub image: DynamicImage,
}

impl HeldScreenshot {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

pub fn screencap_command(settings: &ScreenshotSettings, remote_path: &str) -> Vec<String> {
    let mut command = vec!["screencap".to_string(), "-p".to_string()];
    if settings.display_id >= 0 {
        command.push("-d".to_string());
        command.push(settings.display_id.to_string());
    }
    command.push(remote_path.to_string());
    command
}

/// Worker side of a screenshot: capture on the device, pull to a temporary
/// file, decode. The remote file is removed even when the pull fails.
pub fn capture_screenshot(
    adb: &Adb,
    serial: &str,
    settings: &ScreenshotSettings,
    trace_id: &str,
) -> Result<DynamicImage, AppError> {
    let remote_path = remote_capture_path(&settings.remote_dir, "screencap", serial, "png");
    let mut command = vec!["shell".to_string()];
    command.extend(screencap_command(settings, &remote_path));
    adb.run_checked(&device_args(serial, &command), "adb screencap", trace_id)?;

    let local = tempfile::Builder::new()
        .prefix("greentea_screencap_")
        .suffix(".png")
        .tempfile()
        .map_err(|err| AppError::system(format!("Failed to create temp file: {err}"), trace_id))?;
    let pulled = adb.pull(serial, &remote_path, local.path(), trace_id);
    if let Err(err) = adb.remove_remote(serial, &remote_path, trace_id) {
        warn!(trace_id = %trace_id, error = %err, "failed to remove remote screenshot");
    }
    pulled?;

    decode_image(local.path(), trace_id)
}

pub fn decode_image(path: &Path, trace_id: &str) -> Result<DynamicImage, AppError> {
    let size = fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| AppError::system(format!("Pulled screenshot missing: {err}"), trace_id))?;
    if size == 0 {
        return Err(AppError::dependency("Pulled screenshot is empty", trace_id));
    }
    let image = image::open(path)
        .map_err(|err| AppError::dependency(format!("Failed to decode screenshot: {err}"), trace_id))?;
    debug!(trace_id = %trace_id, width = image.width(), height = image.height(), "screenshot decoded");
    Ok(image)
}

pub fn save_image(image: &DynamicImage, path: &Path, trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::system(format!("Failed to create output dir: {err}"), trace_id))?;
    }
    image
        .save(path)
        .map_err(|err| AppError::system(format!("Failed to save screenshot: {err}"), trace_id))
}
