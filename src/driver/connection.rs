//! Client connection.
//!
//! Layer 3 (async I/O). Methods are split across modules:
//! - `connection.rs` - struct, connect, handshake, ping, close
//! - `query.rs` - query execution
//! - `io.rs` - deadlines and cancellation

use std::time::Duration;

use tokio::io::{AsyncWriteExt, WriteHalf};

use super::cancel::CancelSignal;
use super::io::{deadline, guarded};
use super::options::Options;
use super::stream::{Transport, dial};
use crate::column::NamedColumn;
use crate::error::{Error, Result};
use crate::protocol::block::{Block, Results};
use crate::protocol::buffer::Buffer;
use crate::protocol::compress::Method;
use crate::protocol::feature::{Feature, negotiate};
use crate::protocol::packet::{
    ClientCode, ClientHello, Exception, ServerCode, ServerHello, encode_data_packet,
};
use crate::protocol::reader::Reader;

/// Initial write buffer capacity.
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Upper bound for the best-effort Cancel write and the transport shutdown.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

const fn parse_version(s: &str) -> u64 {
    let b = s.as_bytes();
    let mut v = 0;
    let mut i = 0;
    while i < b.len() {
        v = v * 10 + (b[i] - b'0') as u64;
        i += 1;
    }
    v
}

pub(crate) const VERSION_MAJOR: u64 = parse_version(env!("CARGO_PKG_VERSION_MAJOR"));
pub(crate) const VERSION_MINOR: u64 = parse_version(env!("CARGO_PKG_VERSION_MINOR"));
pub(crate) const VERSION_PATCH: u64 = parse_version(env!("CARGO_PKG_VERSION_PATCH"));

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Handshaking,
    Idle,
    QueryActive,
}

/// One native-protocol connection. Runs one query at a time.
pub struct Client {
    pub(crate) reader: Reader<'static>,
    writer: WriteHalf<Box<dyn Transport>>,
    pub(crate) buf: Buffer,
    opts: Options,
    server: ServerHello,
    revision: u64,
    pub(crate) state: State,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server)
            .field("revision", &self.revision)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dial `addr` (`host:port`) and run the handshake.
    pub async fn connect(addr: &str, opts: Options) -> Result<Self> {
        let stream = dial(addr, &opts).await?;
        tracing::debug!(addr, tls = opts.tls.is_some(), "connected");
        Self::with_stream(stream, opts).await
    }

    /// Run the handshake over an already open stream.
    pub async fn with_stream(stream: impl Transport, opts: Options) -> Result<Self> {
        let boxed: Box<dyn Transport> = Box::new(stream);
        let (rd, wr) = tokio::io::split(boxed);
        let reader = Reader::new(rd).with_max_string_len(opts.limits.max_string_len);
        let mut client = Self {
            reader,
            writer: wr,
            buf: Buffer::with_capacity(BUFFER_CAPACITY),
            revision: opts.revision,
            opts,
            server: ServerHello::default(),
            state: State::Handshaking,
        };
        if let Err(e) = client.handshake().await {
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.buf.reset();
        ClientHello {
            name: self.opts.client_name.clone(),
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            revision: self.opts.revision,
            database: self.opts.database.clone(),
            user: self.opts.user.clone(),
            password: self.opts.password.clone(),
        }
        .encode(&mut self.buf);
        self.flush(None).await?;

        let client_revision = self.opts.revision;
        let reader = &mut self.reader;
        let hello = deadline(
            async {
                match ServerCode::decode(reader).await? {
                    ServerCode::Hello => Ok(ServerHello::decode(reader, client_revision).await?),
                    ServerCode::Exception => Err(Exception::decode(reader).await?.into()),
                    other => Err(Error::Protocol(format!(
                        "unexpected {} packet during handshake",
                        other
                    ))),
                }
            },
            "handshake",
            self.opts.read_timeout,
        )
        .await?;

        self.revision = negotiate(self.opts.revision, hello.revision);
        if Feature::Addendum.supported(self.revision) {
            self.buf.put_string(&self.opts.quota_key);
            self.flush(None).await?;
        }
        tracing::debug!(
            server = %hello.name,
            version = %format!("{}.{}.{}", hello.major, hello.minor, hello.patch.unwrap_or_default()),
            server_revision = hello.revision,
            revision = self.revision,
            timezone = hello.timezone.as_deref().unwrap_or_default(),
            "handshake complete"
        );
        self.server = hello;
        self.state = State::Idle;
        Ok(())
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.buf.reset();
        ClientCode::Ping.encode(&mut self.buf);
        self.flush(None).await?;

        let reader = &mut self.reader;
        let res = deadline(
            async {
                match ServerCode::decode(reader).await? {
                    ServerCode::Pong => Ok(()),
                    ServerCode::Exception => Err(Exception::decode(reader).await?.into()),
                    other => Err(Error::Protocol(format!("expected Pong, got {}", other))),
                }
            },
            "ping",
            self.opts.read_timeout,
        )
        .await;
        match res {
            Err(e) if e.is_fatal() => {
                self.shutdown().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == State::QueryActive {
            self.send_cancel().await;
        }
        self.shutdown().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Disconnected
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn server(&self) -> &ServerHello {
        &self.server
    }

    /// Negotiated revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn ensure_idle(&self) -> Result<()> {
        match self.state {
            State::Idle => Ok(()),
            State::Disconnected => Err(Error::Closed),
            other => Err(Error::Protocol(format!("connection is {:?}", other))),
        }
    }

    pub(crate) fn framing(&self) -> Option<(Method, i32)> {
        self.opts
            .compression
            .method()
            .map(|m| (m, self.opts.compression_level))
    }

    /// Append a client Data packet to the write buffer.
    pub(crate) fn encode_data(&mut self, columns: &mut [NamedColumn]) -> Result<usize> {
        let framing = self.framing();
        encode_data_packet(
            &mut self.buf,
            ClientCode::Data as u64,
            self.revision,
            framing,
            columns,
        )
    }

    /// Body of a Data-like packet: table name, then the block, framed when
    /// compression is on and the packet kind is compressible.
    pub(crate) async fn read_block(&mut self, code: ServerCode, target: &mut Results) -> Result<Block> {
        let _table = self.reader.str().await?;
        let framed = self.framing().is_some() && code.compressible();
        if framed {
            self.reader.enable_compression(self.opts.verify_checksum);
        }
        let res = Block::decode(&mut self.reader, self.revision, &self.opts.limits, target).await;
        if framed {
            self.reader.disable_compression();
        }
        let block = res?;
        tracing::trace!(packet = %code, columns = block.columns, rows = block.rows, "block");
        Ok(block)
    }

    /// Write out the buffer. A failed write closes the connection.
    pub(crate) async fn flush(&mut self, cancel: Option<&mut CancelSignal>) -> Result<()> {
        let writer = &mut self.writer;
        let data = self.buf.as_slice();
        let res = guarded(
            async {
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            },
            "write",
            self.opts.write_timeout,
            cancel,
        )
        .await;
        self.buf.reset();
        if let Err(e) = &res {
            if !matches!(e, Error::Cancelled) {
                self.state = State::Disconnected;
            }
        }
        res
    }

    pub(crate) async fn send_cancel(&mut self) {
        self.buf.reset();
        ClientCode::Cancel.encode(&mut self.buf);
        let writer = &mut self.writer;
        let data = self.buf.as_slice();
        let res = deadline(
            async {
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            },
            "cancel",
            CANCEL_TIMEOUT,
        )
        .await;
        self.buf.reset();
        if let Err(e) = res {
            tracing::debug!(error = %e, "cancel packet not sent");
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        let was = std::mem::replace(&mut self.state, State::Disconnected);
        self.buf.reset();
        let _ = tokio::time::timeout(CANCEL_TIMEOUT, self.writer.shutdown()).await;
        if was != State::Disconnected {
            tracing::debug!("connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0"), 0);
        assert_eq!(parse_version("12"), 12);
        assert_eq!(VERSION_MAJOR, parse_version(env!("CARGO_PKG_VERSION_MAJOR")));
    }
}
