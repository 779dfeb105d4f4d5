//! A tiny Unix-domain control socket exposing the `reload` administrative
//! command from spec §6, separate from the file-watcher-triggered reload
//! path in [`crate::daemon`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use vq_registry::registry::ConfigRegistry;

#[derive(Debug, Error)]
pub enum ControlSocketError {
    #[error("io error on control socket {0}: {1}")]
    Io(String, String),
}

/// Returns the default control socket path, overridable via `VQ_CONTROL_SOCKET`.
pub fn default_socket_path() -> PathBuf {
    std::env::var("VQ_CONTROL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("vq-daemon.sock"))
}

/// Runs the control socket server until `shutdown_rx` fires. Every
/// connection is expected to send the single line `reload\n`, to which the
/// server responds with `ok <generation>\n` or `error <message>\n`.
pub async fn serve(
    socket_path: &Path,
    registry: Arc<ConfigRegistry>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), ControlSocketError> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| ControlSocketError::Io(socket_path.display().to_string(), e.to_string()))?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &registry).await {
                                warn!(error = %e, "control socket connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "control socket accept failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = std::fs::remove_file(socket_path);
                info!("control socket shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    registry: &ConfigRegistry,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 256];
    let n = stream.read(&mut buf).await?;
    let command = String::from_utf8_lossy(&buf[..n]);

    let response = if command.trim() == "reload" {
        match registry.reload() {
            Ok(generation) => format!("ok {generation}\n"),
            Err(e) => format!("error {e}\n"),
        }
    } else {
        format!("error unknown command {:?}\n", command.trim())
    };

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Client side of the `reload` CLI subcommand: connects to the running
/// daemon's control socket, requests an immediate reload, and returns its
/// response line.
pub async fn request_reload(socket_path: &Path) -> Result<String, ControlSocketError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ControlSocketError::Io(socket_path.display().to_string(), e.to_string()))?;
    stream
        .write_all(b"reload\n")
        .await
        .map_err(|e| ControlSocketError::Io(socket_path.display().to_string(), e.to_string()))?;

    let mut buf = vec![0u8; 256];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| ControlSocketError::Io(socket_path.display().to_string(), e.to_string()))?;
    Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}
