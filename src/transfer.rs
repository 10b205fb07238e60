//! SFTP upload over an open session

use std::path::Path;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use crate::error::PushError;
use crate::session::DeviceHandler;

/// Stream a local file to `remote_path` through an SFTP sub-channel
///
/// The sub-channel is closed whether or not the copy succeeds. A partial
/// remote file may be left behind on error.
pub async fn upload(
    handle: &Handle<DeviceHandler>,
    local_path: &Path,
    remote_path: &str,
) -> Result<u64, PushError> {
    let mut source = tokio::fs::File::open(local_path).await.map_err(|e| {
        PushError::Transfer(format!("cannot open {}: {}", local_path.display(), e))
    })?;

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| PushError::Transfer(format!("failed to open channel: {}", e)))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| PushError::Transfer(format!("sftp subsystem unavailable: {}", e)))?;

    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| PushError::Transfer(format!("sftp handshake failed: {}", e)))?;

    let result = async {
        let mut target = sftp.create(remote_path).await.map_err(|e| {
            PushError::Transfer(format!("cannot create {}: {}", remote_path, e))
        })?;

        let written = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(|e| PushError::Transfer(format!("write to {} failed: {}", remote_path, e)))?;

        target
            .shutdown()
            .await
            .map_err(|e| PushError::Transfer(format!("closing {} failed: {}", remote_path, e)))?;

        Ok::<_, PushError>(written)
    }
    .await;

    if let Err(e) = sftp.close().await {
        tracing::debug!("SFTP close failed: {}", e);
    }

    if let Ok(written) = &result {
        tracing::debug!("Uploaded {} bytes to {}", written, remote_path);
    }

    result
}
