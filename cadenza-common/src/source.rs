//! Playback sources
//!
//! A playback source names something the engine can open: a local file or a
//! web stream URL. Sources travel unchanged from the command line, through
//! the instance protocol, into the player queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Kind of a playback source
///
/// Closed set; the numeric values are the wire tags of the instance protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SourceKind {
    /// Local audio file
    File = 0,
    /// HTTP(S) stream
    WebStream = 1,
}

impl SourceKind {
    /// Numeric wire tag
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Map a wire tag back onto a kind, `None` for unknown tags
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::File),
            1 => Some(Self::WebStream),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::File => write!(f, "File"),
            SourceKind::WebStream => write!(f, "WebStream"),
        }
    }
}

/// One entry of a playback request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybackSource {
    pub kind: SourceKind,
    /// Absolute path for files, absolute URL for web streams
    pub location: String,
}

impl PlaybackSource {
    pub fn new(kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::new(SourceKind::File, path.as_ref().to_string_lossy().into_owned())
    }

    pub fn web(url: impl Into<String>) -> Self {
        Self::new(SourceKind::WebStream, url)
    }

    /// Interpret a command-line argument
    ///
    /// `http://` and `https://` URLs become web streams. Anything else is a
    /// file; existing files are made absolute so the receiving instance can
    /// open them regardless of its own working directory.
    pub fn from_arg(arg: &str) -> Self {
        if let Ok(url) = Url::parse(arg) {
            if matches!(url.scheme(), "http" | "https") {
                return Self::web(url.as_str());
            }
            if url.scheme() == "file" {
                if let Ok(path) = url.to_file_path() {
                    return Self::file(absolute_if_exists(&path));
                }
            }
        }
        Self::file(absolute_if_exists(Path::new(arg)))
    }

    /// Path of a file source
    pub fn path(&self) -> Option<&Path> {
        match self.kind {
            SourceKind::File => Some(Path::new(&self.location)),
            SourceKind::WebStream => None,
        }
    }
}

impl fmt::Display for PlaybackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.location)
    }
}

fn absolute_if_exists(path: &Path) -> PathBuf {
    if path.exists() {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}
