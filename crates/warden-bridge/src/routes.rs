//! Routing table shared by the client (to build requests) and the server
//! (to mount handlers).

use std::fmt;

use reqwest::{Method, Url};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("missing route parameter '{0}'")]
    MissingParam(String),

    #[error("empty route parameter '{0}'")]
    EmptyParam(String),

    #[error("base address cannot carry a path: {0}")]
    InvalidBase(Url),
}

/// Symbolic name of every operation on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteName {
    Ping,
    Capacity,
    Create,
    List,
    Destroy,
    Info,
    Stop,
    StreamIn,
    StreamOut,
    CopyIn,
    CopyOut,
    LimitBandwidth,
    CurrentBandwidthLimits,
    LimitCpu,
    CurrentCpuLimits,
    LimitDisk,
    CurrentDiskLimits,
    LimitMemory,
    CurrentMemoryLimits,
    NetIn,
    NetOut,
    GetProperty,
    SetProperty,
    RemoveProperty,
    Run,
    Attach,
    ProcessStream,
}

impl RouteName {
    pub const ALL: [RouteName; 27] = [
        Self::Ping,
        Self::Capacity,
        Self::Create,
        Self::List,
        Self::Destroy,
        Self::Info,
        Self::Stop,
        Self::StreamIn,
        Self::StreamOut,
        Self::CopyIn,
        Self::CopyOut,
        Self::LimitBandwidth,
        Self::CurrentBandwidthLimits,
        Self::LimitCpu,
        Self::CurrentCpuLimits,
        Self::LimitDisk,
        Self::CurrentDiskLimits,
        Self::LimitMemory,
        Self::CurrentMemoryLimits,
        Self::NetIn,
        Self::NetOut,
        Self::GetProperty,
        Self::SetProperty,
        Self::RemoveProperty,
        Self::Run,
        Self::Attach,
        Self::ProcessStream,
    ];

    pub fn method(self) -> Method {
        match self {
            Self::Ping
            | Self::Capacity
            | Self::List
            | Self::Info
            | Self::StreamOut
            | Self::CurrentBandwidthLimits
            | Self::CurrentCpuLimits
            | Self::CurrentDiskLimits
            | Self::CurrentMemoryLimits
            | Self::GetProperty
            | Self::Attach
            | Self::ProcessStream => Method::GET,
            Self::Create | Self::CopyIn | Self::CopyOut | Self::NetIn | Self::NetOut | Self::Run => {
                Method::POST
            }
            Self::Stop
            | Self::StreamIn
            | Self::LimitBandwidth
            | Self::LimitCpu
            | Self::LimitDisk
            | Self::LimitMemory
            | Self::SetProperty => Method::PUT,
            Self::Destroy | Self::RemoveProperty => Method::DELETE,
        }
    }

    /// Path template; `{name}` segments are filled from route parameters.
    pub fn path(self) -> &'static str {
        match self {
            Self::Ping => "/ping",
            Self::Capacity => "/capacity",
            Self::Create | Self::List => "/containers",
            Self::Destroy => "/containers/{handle}",
            Self::Info => "/containers/{handle}/info",
            Self::Stop => "/containers/{handle}/stop",
            Self::StreamIn | Self::StreamOut => "/containers/{handle}/files",
            Self::CopyIn => "/containers/{handle}/copy_in",
            Self::CopyOut => "/containers/{handle}/copy_out",
            Self::LimitBandwidth | Self::CurrentBandwidthLimits => {
                "/containers/{handle}/limits/bandwidth"
            }
            Self::LimitCpu | Self::CurrentCpuLimits => "/containers/{handle}/limits/cpu",
            Self::LimitDisk | Self::CurrentDiskLimits => "/containers/{handle}/limits/disk",
            Self::LimitMemory | Self::CurrentMemoryLimits => "/containers/{handle}/limits/memory",
            Self::NetIn => "/containers/{handle}/net/in",
            Self::NetOut => "/containers/{handle}/net/out",
            Self::GetProperty | Self::SetProperty | Self::RemoveProperty => {
                "/containers/{handle}/properties/{key}"
            }
            Self::Run => "/containers/{handle}/processes",
            Self::Attach => "/containers/{handle}/processes/{pid}",
            Self::ProcessStream => "/containers/{handle}/processes/{pid}/streams/{stream_id}/{stream}",
        }
    }

    /// Whether a successful response upgrades the connection to a raw stream.
    pub fn upgrades(self) -> bool {
        matches!(self, Self::Run | Self::Attach | Self::ProcessStream)
    }

    /// Build the request URL against `base`, percent-encoding each parameter.
    pub fn url(
        self,
        base: &Url,
        params: &[(&str, &str)],
        query: &[(&str, &str)],
    ) -> Result<Url, RouteError> {
        let mut segments = Vec::new();
        for segment in self.path().split('/').filter(|s| !s.is_empty()) {
            let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
                segments.push(segment);
                continue;
            };
            let value = params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
                .ok_or_else(|| RouteError::MissingParam(name.to_string()))?;
            if value.is_empty() {
                return Err(RouteError::EmptyParam(name.to_string()));
            }
            segments.push(value);
        }

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| RouteError::InvalidBase(base.clone()))?
            .clear()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
