//! Connection driver (Layer 3: async I/O).
//!
//! - `connection.rs` - `Client`, connect, handshake, ping, close
//! - `query.rs` - `Query` and the receive loop
//! - `options.rs` - `Options`, TOML loading
//! - `stream.rs` - TCP/TLS transport
//! - `cancel.rs` - cancellation handles
//! - `io.rs` - deadlines

mod cancel;
mod connection;
mod io;
mod options;
mod query;
mod stream;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use connection::{Client, State};
pub use options::{Compression, Options, TlsConfig, TlsFiles};
pub use query::{Query, QueryStats};
pub use stream::{ChStream, Transport, dial};
