use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::EngineError;

/// Dial the engine at `endpoint` ("host:port"), giving up after `timeout`.
///
/// Engine calls are small request/response exchanges, so Nagle is disabled.
pub async fn dial(endpoint: &str, timeout: Duration) -> Result<TcpStream, EngineError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| EngineError::Unreachable(format!("connecting to {endpoint} timed out")))?
        .map_err(|e| EngineError::Unreachable(format!("{endpoint}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(EngineError::unreachable)?;
    Ok(stream)
}

/// Accept one engine connection from a listener.
pub async fn accept(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((stream, addr))
}
