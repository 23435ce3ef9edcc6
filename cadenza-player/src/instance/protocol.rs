//! Wire format for handing a playback request to the running instance
//!
//! A request is a single one-way message, all integers little-endian:
//!
//! ```text
//! u64  identity   FNV-1a 64 of "cadenza.instance.PlaybackServer"
//! i32  version    PROTOCOL_VERSION
//! i32  count      number of entries
//! per entry:
//!   i32  length   UTF-8 byte length of the location
//!   [u8] location
//!   u32  tag      SourceKind tag (0 = file, 1 = web stream)
//! ```
//!
//! Nothing is ever written back to the sender. Every read on the receiving
//! side is bounded by a timeout so a stalled peer cannot hold a connection.

use cadenza_common::source::{PlaybackSource, SourceKind};
use fnv::FnvHasher;
use std::hash::Hasher;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Service name hashed into the identity prefix
pub const SERVICE_NAME: &str = "cadenza.instance.PlaybackServer";

/// Current wire version
pub const PROTOCOL_VERSION: i32 = 1;

/// Upper bound on entries in one request
pub const MAX_ENTRIES: i32 = 4096;

/// Upper bound on one location in bytes
pub const MAX_LOCATION_LEN: i32 = 32 * 1024;

/// Ways a received request can be rejected
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Timed out reading {0}")]
    Timeout(&'static str),

    #[error("Identity mismatch: expected {expected:#018x}, got {actual:#018x}")]
    IdentityMismatch { expected: u64, actual: u64 },

    #[error("Unsupported protocol version {0}")]
    VersionMismatch(i32),

    #[error("Invalid entry count {0}")]
    InvalidCount(i32),

    #[error("Invalid entry length {0}")]
    InvalidLength(i32),

    #[error("Entry location is not valid UTF-8")]
    InvalidUtf8,

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// FNV-1a 64 of [`SERVICE_NAME`]
pub fn protocol_identity() -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(SERVICE_NAME.as_bytes());
    hasher.finish()
}

/// One entry as it appeared on the wire
///
/// The tag is kept raw so the receiver can skip unknown kinds without
/// dropping the rest of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    pub location: String,
    pub tag: u32,
}

impl WireEntry {
    /// The entry as a playback source, `None` for an unknown tag
    pub fn source(&self) -> Option<PlaybackSource> {
        SourceKind::from_tag(self.tag).map(|kind| PlaybackSource::new(kind, self.location.clone()))
    }
}

impl From<&PlaybackSource> for WireEntry {
    fn from(source: &PlaybackSource) -> Self {
        Self {
            location: source.location.clone(),
            tag: source.kind.tag(),
        }
    }
}

/// Serialize a request
pub fn encode_request(sources: &[PlaybackSource]) -> Vec<u8> {
    let entries: Vec<WireEntry> = sources.iter().map(WireEntry::from).collect();
    encode_entries(protocol_identity(), PROTOCOL_VERSION, &entries)
}

/// Serialize raw entries under an explicit identity and version
///
/// Used directly only to produce foreign or outdated requests.
pub fn encode_entries(identity: u64, version: i32, entries: &[WireEntry]) -> Vec<u8> {
    let body: usize = entries.iter().map(|e| 8 + e.location.len()).sum();
    let mut buf = Vec::with_capacity(16 + body);
    buf.extend_from_slice(&identity.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as i32).to_le_bytes());
    for entry in entries {
        buf.extend_from_slice(&(entry.location.len() as i32).to_le_bytes());
        buf.extend_from_slice(entry.location.as_bytes());
        buf.extend_from_slice(&entry.tag.to_le_bytes());
    }
    buf
}

/// Write a request and flush it
pub async fn write_request<W>(writer: &mut W, sources: &[PlaybackSource]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_request(sources)).await?;
    writer.flush().await
}

/// Incremental, timeout-bounded request decoder
///
/// The server reads the preamble, reacts to it, then pulls entries one at a
/// time so each is dispatched in transmission order as soon as it arrives.
pub struct RequestReader<R> {
    reader: R,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(reader: R, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    /// Read and check identity and version
    pub async fn read_preamble(&mut self) -> Result<(), ProtocolError> {
        let timeout = self.timeout;
        let identity = bounded(timeout, "identity", self.reader.read_u64_le()).await?;
        let expected = protocol_identity();
        if identity != expected {
            return Err(ProtocolError::IdentityMismatch {
                expected,
                actual: identity,
            });
        }

        let version = bounded(timeout, "version", self.reader.read_i32_le()).await?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        Ok(())
    }

    /// Read the entry count
    pub async fn read_count(&mut self) -> Result<usize, ProtocolError> {
        let count = bounded(self.timeout, "entry count", self.reader.read_i32_le()).await?;
        if !(0..=MAX_ENTRIES).contains(&count) {
            return Err(ProtocolError::InvalidCount(count));
        }
        Ok(count as usize)
    }

    /// Read one entry
    pub async fn read_entry(&mut self) -> Result<WireEntry, ProtocolError> {
        let timeout = self.timeout;
        let length = bounded(timeout, "entry length", self.reader.read_i32_le()).await?;
        if !(0..=MAX_LOCATION_LEN).contains(&length) {
            return Err(ProtocolError::InvalidLength(length));
        }

        let mut bytes = vec![0u8; length as usize];
        bounded(timeout, "entry location", self.reader.read_exact(&mut bytes)).await?;
        let location = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;

        let tag = bounded(timeout, "entry tag", self.reader.read_u32_le()).await?;
        Ok(WireEntry { location, tag })
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Read a complete request in one go
pub async fn read_request<R>(reader: R, timeout: Duration) -> Result<Vec<WireEntry>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = RequestReader::new(reader, timeout);
    reader.read_preamble().await?;
    let count = reader.read_count().await?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(reader.read_entry().await?);
    }
    Ok(entries)
}

async fn bounded<T, F>(timeout: Duration, what: &'static str, read: F) -> Result<T, ProtocolError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::Timeout(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_identity_is_fnv1a_of_service_name() {
        // FNV-1a 64: offset basis 0xcbf29ce484222325, prime 0x100000001b3
        let mut expected: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in SERVICE_NAME.bytes() {
            expected ^= byte as u64;
            expected = expected.wrapping_mul(0x0000_0100_0000_01b3);
        }
        assert_eq!(protocol_identity(), expected);
    }

    #[test]
    fn test_encoded_layout() {
        let bytes = encode_request(&[PlaybackSource::web("http://a/b")]);
        assert_eq!(&bytes[0..8], &protocol_identity().to_le_bytes());
        assert_eq!(&bytes[8..12], &1i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &10i32.to_le_bytes());
        assert_eq!(&bytes[20..30], b"http://a/b");
        assert_eq!(&bytes[30..34], &1u32.to_le_bytes());
        assert_eq!(bytes.len(), 34);
    }

    #[tokio::test]
    async fn test_request_round_trip_preserves_order_and_kind() {
        let sources = vec![
            PlaybackSource::file("/music/ünïcödé.flac"),
            PlaybackSource::web("https://radio.example/stream"),
            PlaybackSource::file("/music/b.mp3"),
        ];
        let mut buf = Vec::new();
        write_request(&mut buf, &sources).await.unwrap();

        let entries = read_request(buf.as_slice(), TIMEOUT).await.unwrap();
        let decoded: Vec<PlaybackSource> = entries.iter().filter_map(WireEntry::source).collect();
        assert_eq!(decoded, sources);
    }

    #[tokio::test]
    async fn test_empty_request() {
        let entries = read_request(encode_request(&[]).as_slice(), TIMEOUT).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_identity_mismatch() {
        let bytes = encode_entries(0xdead_beef, PROTOCOL_VERSION, &[]);
        let err = read_request(bytes.as_slice(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::IdentityMismatch { actual: 0xdead_beef, .. }));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let bytes = encode_entries(protocol_identity(), 2, &[]);
        let err = read_request(bytes.as_slice(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch(2)));
    }

    #[tokio::test]
    async fn test_negative_count_rejected() {
        let mut bytes = encode_request(&[]);
        bytes[12..16].copy_from_slice(&(-1i32).to_le_bytes());
        let err = read_request(bytes.as_slice(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCount(-1)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut bytes = encode_request(&[PlaybackSource::file("/a")]);
        bytes[16..20].copy_from_slice(&(MAX_LOCATION_LEN + 1).to_le_bytes());
        let err = read_request(bytes.as_slice(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let mut bytes = encode_request(&[PlaybackSource::file("/ab")]);
        bytes[20] = 0xff;
        let err = read_request(bytes.as_slice(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8));
    }

    #[tokio::test]
    async fn test_truncated_request_is_io_error() {
        let bytes = encode_request(&[PlaybackSource::file("/music/a.mp3")]);
        let err = read_request(&bytes[..bytes.len() - 2], TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_survives_decoding() {
        let entries = vec![WireEntry {
            location: "x".to_string(),
            tag: 7,
        }];
        let bytes = encode_entries(protocol_identity(), PROTOCOL_VERSION, &entries);
        let decoded = read_request(bytes.as_slice(), TIMEOUT).await.unwrap();
        assert_eq!(decoded, entries);
        assert!(decoded[0].source().is_none());
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = RequestReader::new(server, Duration::from_millis(50));
        let err = reader.read_preamble().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout("identity")));
        drop(client);
    }
}
