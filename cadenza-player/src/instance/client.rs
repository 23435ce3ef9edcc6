//! Sending side of the hand-off
//!
//! Fire and forget: connect, write the request, close the write half. The
//! server never answers.

use super::protocol::write_request;
use crate::error::{Error, Result};
use cadenza_common::PlaybackSource;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Deliver `sources` to the instance listening on `port`
///
/// Connecting and writing are each bounded by `timeout`.
pub async fn forward_request(port: u16, sources: &[PlaybackSource], timeout: Duration) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Instance(format!("Connecting to {} timed out", addr)))??;

    tokio::time::timeout(timeout, async {
        write_request(&mut stream, sources).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| Error::Instance(format!("Sending request to {} timed out", addr)))??;

    debug!("Sent {} entries to {}", sources.len(), addr);
    Ok(())
}
