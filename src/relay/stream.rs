//! Stream relay.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::TARGET_DIAL_TIMEOUT_SECS;

/// Connect to a relay destination (`host:port`) within the target dial deadline.
pub async fn connect_target(target: &str) -> Result<TcpStream> {
    connect_within(target, Duration::from_secs(TARGET_DIAL_TIMEOUT_SECS)).await
}

pub(crate) async fn connect_within(target: &str, deadline: Duration) -> Result<TcpStream> {
    let stream = timeout(deadline, TcpStream::connect(target))
        .await
        .map_err(|_| Error::Timeout(deadline.as_millis() as u64))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Copy bytes both ways until each side has closed.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let counts = tokio::io::copy_bidirectional(a, b).await?;
    Ok(counts)
}
