//! Frames exchanged on a hijacked process connection.
//!
//! Two directions:
//! - **server -> client** ([`ProcessPayload`]): started, data, exited, error
//! - **client -> server** ([`ProcessInput`]): stdin chunks and stdin close

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies the auxiliary output streams of one process session.
///
/// Assigned by the server when a run or attach session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(uuid::Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output stream that can be carried over an auxiliary hijack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("unknown stream type '{other}'")),
        }
    }
}

/// Origin of a data frame.
///
/// `Stdin` only appears when a backend echoes input back; clients ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Stdout,
    Stderr,
    Stdin,
}

impl PayloadSource {
    pub fn stream_type(&self) -> Option<StreamType> {
        match self {
            Self::Stdout => Some(StreamType::Stdout),
            Self::Stderr => Some(StreamType::Stderr),
            Self::Stdin => None,
        }
    }
}

impl From<StreamType> for PayloadSource {
    fn from(stream: StreamType) -> Self {
        match stream {
            StreamType::Stdout => Self::Stdout,
            StreamType::Stderr => Self::Stderr,
        }
    }
}

/// Server -> client frame.
///
/// `Started` is always first; `Exited` and `Error` are terminal and nothing
/// follows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessPayload {
    Started {
        process_id: u32,
        stream_id: StreamId,
    },

    Data {
        process_id: u32,
        source: PayloadSource,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    Exited {
        process_id: u32,
        exit_status: u32,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process_id: Option<u32>,
        message: String,
    },

    /// Frame type this version does not know. Readers skip it.
    #[serde(other)]
    Unknown,
}

/// Client -> server frame on the main process connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessInput {
    Stdin {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    /// Stdin reached EOF on the client.
    CloseStdin,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
