//! ClickHouse native protocol client.
//!
//! **Layers:** byte buffer and reader, column codecs, block and compressed-frame
//! framing, then an async connection running one query at a time.
//!
//! ```ignore
//! let mut client = Client::connect("localhost:9000", Options::new()).await?;
//! let mut q = Query::new("SELECT number FROM system.numbers LIMIT 10");
//! client.query(&mut q).await?;
//! let numbers = q.results().get::<ColUInt64>("number");
//! ```

pub mod column;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod types;

pub use column::{Column, NamedColumn, new_column};
pub use driver::{
    CancelHandle, CancelSignal, Client, Compression, Options, Query, QueryStats, State, TlsConfig,
    cancel_pair,
};
pub use error::{DecodeError, Error, Result, TypeError};
pub use protocol::{DecodeLimits, Exception, Results, Setting};
pub use types::ColumnType;
