//! Minimal QMP (QEMU Machine Protocol) client: enough to negotiate
//! capabilities and fire single commands at a VM's control socket.

#[cfg(unix)]
use std::path::Path;

#[cfg(unix)]
use serde_json::json;
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::UnixStream;

use hypervisor_types::{Error, Result};

/// Execute one QMP command against the socket and return once the response
/// line arrives. Events interleaved by QEMU are skipped.
#[cfg(unix)]
pub(crate) async fn execute(socket: &Path, command: &str) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Error::unavailable(format!("qmp socket {}: {}", socket.display(), e)))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Greeting, then capability negotiation.
    read_response(&mut lines).await?;
    send(&mut write_half, &json!({ "execute": "qmp_capabilities" })).await?;
    read_response(&mut lines).await?;

    send(&mut write_half, &json!({ "execute": command })).await?;
    read_response(&mut lines).await
}

#[cfg(unix)]
async fn send(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    payload: &serde_json::Value,
) -> Result<()> {
    let mut line = payload.to_string();
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::unavailable(format!("qmp write: {}", e)))
}

#[cfg(unix)]
async fn read_response(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> Result<()> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| Error::unavailable(format!("qmp read: {}", e)))?
            .ok_or_else(|| Error::unavailable("qmp socket closed"))?;
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if value.get("event").is_some() {
            continue;
        }
        if let Some(error) = value.get("error") {
            return Err(Error::internal(format!("qmp error: {}", error)));
        }
        return Ok(());
    }
}

#[cfg(not(unix))]
pub(crate) async fn execute(_socket: &std::path::Path, _command: &str) -> Result<()> {
    Err(Error::NotSupported("qmp is only available on unix".into()))
}
