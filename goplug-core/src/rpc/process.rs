//! Spawning an RPC plugin and completing the handshake

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use goplug_plugin_api::rpc::{HandshakeConfig, HandshakeLine, Network};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::{PluginHostError, Result};
use crate::output::forward_lines;

/// Byte stream to a plugin
pub(crate) trait Channel: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> Channel for T {}

pub(crate) type BoxedChannel = Pin<Box<dyn Channel>>;

/// A child that completed the handshake
pub(crate) struct Launched {
    pub child: Child,
    pub channel: BoxedChannel,
    pub line: HandshakeLine,
}

/// Spawn `path`, read its handshake line, and connect to the announced address.
///
/// Everything happens under `startup_timeout`. On any failure the child is
/// killed and reaped before the error is returned.
pub(crate) async fn launch(
    path: &Path,
    logger: &str,
    handshake: &HandshakeConfig,
    startup_timeout: Duration,
) -> Result<Launched> {
    let deadline = Instant::now() + startup_timeout;

    let mut child = Command::new(path)
        .env(&handshake.cookie_key, &handshake.cookie_value)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            PluginHostError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to spawn {}: {}", path.display(), e),
            ))
        })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, logger.to_string(), "stderr", false));
    }

    let Some(stdout) = child.stdout.take() else {
        reap(&mut child).await;
        return Err(handshake_error(path, "stdout not captured"));
    };
    let mut lines = BufReader::new(stdout).lines();

    let first = tokio::time::timeout_at(deadline, lines.next_line()).await;
    let raw = match first {
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) => {
            let status = reap(&mut child).await;
            return Err(PluginHostError::ChildCrash {
                name: logger.to_string(),
                status: format!("exited before handshake ({status})"),
            });
        }
        Ok(Err(e)) => {
            reap(&mut child).await;
            return Err(handshake_error(path, &format!("reading handshake: {e}")));
        }
        Err(_) => {
            reap(&mut child).await;
            return Err(handshake_error(
                path,
                &format!("no handshake within {startup_timeout:?}"),
            ));
        }
    };

    let line = match raw
        .parse::<HandshakeLine>()
        .and_then(|line| line.verify(handshake).map(|()| line))
    {
        Ok(line) => line,
        Err(e) => {
            reap(&mut child).await;
            return Err(handshake_error(path, &e.to_string()));
        }
    };
    tracing::debug!(plugin = %logger, network = %line.network, address = %line.address, "Handshake complete");

    // Keep draining stdout so the child never blocks on a full pipe
    let inner = lines.into_inner();
    tokio::spawn(forward_lines(inner, logger.to_string(), "stdout", false));

    let channel = match tokio::time::timeout_at(deadline, connect(&line)).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            reap(&mut child).await;
            return Err(handshake_error(path, &format!("connecting to {}: {e}", line.address)));
        }
        Err(_) => {
            reap(&mut child).await;
            return Err(handshake_error(path, "connect timed out"));
        }
    };

    Ok(Launched {
        child,
        channel,
        line,
    })
}

async fn connect(line: &HandshakeLine) -> std::io::Result<BoxedChannel> {
    match line.network {
        Network::Tcp => {
            let stream = TcpStream::connect(&line.address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::pin(stream))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(&line.address).await?;
            Ok(Box::pin(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
    }
}

/// Kill the child if it still runs and wait for it. Returns the exit status text.
pub(crate) async fn reap(child: &mut Child) -> String {
    if let Ok(Some(status)) = child.try_wait() {
        return status.to_string();
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill plugin process");
    }
    match child.wait().await {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

fn handshake_error(path: &Path, reason: &str) -> PluginHostError {
    PluginHostError::Handshake {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_wrong_cookie_is_handshake_error() {
        let dir = TempDir::new().unwrap();
        let path = script(
            &dir,
            "goplug-bad",
            "echo '1|tcp|127.0.0.1:1|goplug-json|GOPLUG_PLUGIN=wrong'\nexec sleep 30",
        );
        let err = launch(&path, "bad", &HandshakeConfig::default(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginHostError::Handshake { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_early_exit_is_child_crash() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "goplug-quit", "exit 3");
        let err = launch(&path, "quit", &HandshakeConfig::default(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginHostError::ChildCrash { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_silent_child_times_out() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "goplug-mute", "exec sleep 30");
        let err = launch(
            &path,
            "mute",
            &HandshakeConfig::default(),
            Duration::from_millis(200),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("no handshake"), "{err}");
    }
}
