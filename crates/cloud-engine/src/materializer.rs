//! Image materializer: stat the expected path, verify checksum if present,
//! else download to a per-worker-unique staging name and atomically
//! replace.

use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::Image;
use cloud_transport::node_shell::NodeShell;

/// Ensure `image`'s disk file exists under `target_folder` on the node
/// behind `shell`, downloading via its fallback URL if missing or
/// checksum-mismatched. Returns the absolute path to the verified disk.
pub async fn materialize(
    shell: &dyn NodeShell,
    image: &Image,
    target_folder: &str,
) -> EngineResult<String> {
    let mkdir = shell
        .exec(&format!("mkdir -p {target_folder}"))
        .await
        .map_err(|e| EngineError::resource_unavailable("could not reserve download dir", e))?;
    if !mkdir.success() {
        return Err(EngineError::ResourceUnavailable(format!(
            "could not reserve download dir {target_folder}"
        )));
    }

    let target = format!("{target_folder}/{}", image.disk_file);

    if checksum_ok(shell, &target, image).await? {
        return Ok(target);
    }

    let fallback_url = image
        .fallback_url
        .as_deref()
        .ok_or_else(|| EngineError::ResourceUnavailable(format!("no fallback URL for image '{}'", image.id)))?;

    let staging = format!("{target_folder}/{}-{}", std::process::id(), image.id);
    let download = shell
        .exec(&format!("wget -q {fallback_url} -O {staging}"))
        .await
        .map_err(|e| EngineError::resource_unavailable("image download failed", e))?;
    if !download.success() {
        return Err(EngineError::ResourceUnavailable(format!(
            "download of image '{}' from {fallback_url} failed",
            image.id
        )));
    }

    if let Some(expected) = &image.disk_sha256 {
        let actual = sha256_of(shell, &staging).await?;
        if &actual != expected {
            return Err(EngineError::ResourceUnavailable(format!(
                "checksum mismatch for image '{}': expected {expected}, got {actual}",
                image.id
            )));
        }
    }

    let replace = shell
        .exec(&format!("rm -f {target} && mv {staging} {target}"))
        .await
        .map_err(|e| EngineError::resource_unavailable("could not install downloaded image", e))?;
    if !replace.success() {
        return Err(EngineError::ResourceUnavailable(format!(
            "could not atomically install image '{}' at {target}",
            image.id
        )));
    }

    Ok(target)
}

async fn checksum_ok(shell: &dyn NodeShell, path: &str, image: &Image) -> EngineResult<bool> {
    let stat = shell
        .exec(&format!("stat -c%s {path}"))
        .await
        .map_err(|e| EngineError::resource_unavailable("could not stat image path", e))?;
    if !stat.success() {
        return Ok(false);
    }
    match &image.disk_sha256 {
        None => Ok(true),
        Some(expected) => Ok(&sha256_of(shell, path).await? == expected),
    }
}

async fn sha256_of(shell: &dyn NodeShell, path: &str) -> EngineResult<String> {
    let out = shell
        .exec(&format!("sha256sum {path} | cut -d' ' -f1"))
        .await
        .map_err(|e| EngineError::resource_unavailable("could not checksum image", e))?;
    if !out.success() {
        return Err(EngineError::ResourceUnavailable(format!("could not checksum {path}")));
    }
    Ok(out.stdout_string().trim().to_string())
}
