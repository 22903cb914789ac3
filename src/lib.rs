//! # qail-ch
//!
//! Async client for the ClickHouse native TCP protocol.
//!
//! - `protocol` - frame codec, checksummed LZ4 framing, packet encoding
//! - `types` - columnar blocks, column codecs, dynamic values
//! - `driver` - connections, pool, sessions, retries, cursors
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use qail_ch::prelude::*;
//!
//! let client = ChClient::new(ChConfig::new("localhost:9000").pool_size(4))?;
//! let mut rows = client.query("SELECT number FROM system.numbers LIMIT 3").await?.rows();
//! while let Some(row) = rows.next().await {
//!     println!("{}", row.int(0));
//! }
//! rows.close().await?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::{ChConfig, PoolConfig, TlsConfig};
pub use driver::{
    BlockCursor, ChClient, ChConnection, ChPool, ChRow, QueryOptions, QueryResult, Row, Rows,
};
pub use error::{ChError, ChResult, ServerError};
pub use types::{Block, Column, Value};

pub mod prelude {
    pub use crate::config::{ChConfig, PoolConfig, TlsConfig};
    pub use crate::driver::{
        BlockCursor, ChClient, ChRow, QueryHook, QueryOptions, QueryResult, Row, Rows,
        TracingHook,
    };
    pub use crate::error::{ChError, ChResult, ServerError};
    pub use crate::protocol::SettingValue;
    pub use crate::types::{Block, Column, Value};
}
