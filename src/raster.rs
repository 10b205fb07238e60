//! Sanity check for the rendered image before it is pushed

use std::path::{Path, PathBuf};

/// Read the image header, returning its dimensions
///
/// Catches files the renderer is still writing or left truncated, which the
/// device would otherwise draw as garbage.
pub async fn validate(path: &Path) -> Result<(u32, u32), String> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || image::image_dimensions(&path))
        .await
        .map_err(|e| format!("image check task failed: {}", e))?
        .map_err(|e| format!("not a readable image: {}", e))
}
