//! ClickHouse native protocol constants and message payloads.
//!
//! Reference: `src/Core/Protocol.h` and `src/Core/ProtocolDefines.h`
//! in the ClickHouse source tree.

use std::fmt;
use std::time::Duration;

/// Client (client → server) packet tags.
pub mod client {
    pub const HELLO: u64 = 0;
    pub const QUERY: u64 = 1;
    pub const DATA: u64 = 2;
    pub const CANCEL: u64 = 3;
    pub const PING: u64 = 4;
    pub const TABLES_STATUS_REQUEST: u64 = 5;
    pub const KEEP_ALIVE: u64 = 6;
}

/// Server (server → client) packet tags.
pub mod server {
    pub const HELLO: u64 = 0;
    pub const DATA: u64 = 1;
    pub const EXCEPTION: u64 = 2;
    pub const PROGRESS: u64 = 3;
    pub const PONG: u64 = 4;
    pub const END_OF_STREAM: u64 = 5;
    pub const PROFILE_INFO: u64 = 6;
    pub const TOTALS: u64 = 7;
    pub const EXTREMES: u64 = 8;
    pub const TABLES_STATUS_RESPONSE: u64 = 9;
    pub const LOG: u64 = 10;
    pub const TABLE_COLUMNS: u64 = 11;
    pub const PART_UUIDS: u64 = 12;
    pub const READ_TASK_REQUEST: u64 = 13;
    pub const PROFILE_EVENTS: u64 = 14;
    pub const TREE_READ_TASK_REQUEST: u64 = 15;
}

/// Minimum server revisions for optional packet fields.
pub mod revision {
    pub const CLIENT_INFO: u64 = 54032;
    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const CLIENT_WRITE_INFO: u64 = 54420;
    pub const SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
    pub const INTERSERVER_SECRET: u64 = 54441;
    pub const OPENTELEMETRY: u64 = 54442;
    pub const DISTRIBUTED_DEPTH: u64 = 54448;
    pub const INITIAL_QUERY_START_TIME: u64 = 54449;
    pub const INCREMENTAL_PROFILE_EVENTS: u64 = 54451;
    pub const PARALLEL_REPLICAS: u64 = 54453;
    pub const SERVER_QUERY_TIME_IN_PROGRESS: u64 = 54460;
}

/// Protocol revision this client speaks.
pub const TCP_PROTOCOL_VERSION: u64 = revision::PARALLEL_REPLICAS;

pub const CLIENT_NAME: &str = "qail-ch";
pub const CLIENT_VERSION_MAJOR: u64 = 1;
pub const CLIENT_VERSION_MINOR: u64 = 1;

/// Query kind in client info.
pub const QUERY_INITIAL: u8 = 1;
/// Client interface in client info.
pub const INTERFACE_TCP: u8 = 1;
/// Processing stage requested from the server.
pub const STAGE_COMPLETE: u64 = 2;

/// Server identity reported in the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub major: u64,
    pub minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub patch: Option<u64>,
}

impl ServerInfo {
    /// Revision both sides understand.
    pub fn negotiated_revision(&self) -> u64 {
        self.revision.min(TCP_PROTOCOL_VERSION)
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.name, self.major, self.minor)?;
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        write!(f, " (revision {})", self.revision)
    }
}

/// Accumulated query progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub wrote_rows: u64,
    pub wrote_bytes: u64,
    pub elapsed: Duration,
}

impl Progress {
    /// Merge one Progress packet. `total_rows` is an estimate and is
    /// replaced rather than summed.
    pub fn merge(&mut self, other: &Progress) {
        self.rows += other.rows;
        self.bytes += other.bytes;
        if other.total_rows != 0 {
            self.total_rows = other.total_rows;
        }
        self.wrote_rows += other.wrote_rows;
        self.wrote_bytes += other.wrote_bytes;
        self.elapsed += other.elapsed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

/// A query-level setting value.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    String(String),
}

impl SettingValue {
    /// Parse a textual value as bool, then integer, then string.
    pub fn parse(s: &str) -> Self {
        match s {
            "true" | "TRUE" | "True" | "t" | "T" => return SettingValue::Bool(true),
            "false" | "FALSE" | "False" | "f" | "F" => return SettingValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = s.parse::<i64>() {
            return SettingValue::Int(n);
        }
        SettingValue::String(s.to_string())
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(true) => f.write_str("1"),
            SettingValue::Bool(false) => f.write_str("0"),
            SettingValue::Int(n) => write!(f, "{}", n),
            SettingValue::UInt(n) => write!(f, "{}", n),
            SettingValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::UInt(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::String(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::String(v)
    }
}

/// OpenTelemetry span context forwarded with a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub trace_state: String,
    pub flags: u8,
}

impl TraceContext {
    pub fn new(trace_id: [u8; 16], span_id: [u8; 8]) -> Self {
        Self {
            trace_id,
            span_id,
            trace_state: String::new(),
            // sampled
            flags: 1,
        }
    }
}
