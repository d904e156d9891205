//! Packet codes and packet bodies.
//!
//! Every gated structure takes the negotiated revision explicitly. Bodies that
//! only the server sends still get an `encode` so scripted servers in tests can
//! produce them.

use std::fmt;

use super::block::{Block, BlockInfo, Results};
use super::buffer::Buffer;
use super::compress::{Method, encode_frames};
use super::feature::Feature;
use super::reader::Reader;
use crate::column::{ColInt8, ColInt64, ColStr, ColUInt32, ColUInt64, Column, NamedColumn};
use crate::error::{DecodeError, Error, Result};
use crate::types::parser::quote;

/// Cap on the PartUUIDs list.
const MAX_PART_UUIDS: u64 = 1 << 20;
/// Cap on nested exception depth.
const MAX_EXCEPTION_DEPTH: usize = 64;

/// Packets sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientCode {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

impl ClientCode {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => ClientCode::Hello,
            1 => ClientCode::Query,
            2 => ClientCode::Data,
            3 => ClientCode::Cancel,
            4 => ClientCode::Ping,
            _ => return None,
        })
    }

    pub fn encode(self, buf: &mut Buffer) {
        buf.put_varint(self as u64);
    }
}

/// Packets sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerCode {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    Totals = 7,
    Extremes = 8,
    TablesStatusResponse = 9,
    Log = 10,
    TableColumns = 11,
    PartUuids = 12,
    ReadTaskRequest = 13,
    ProfileEvents = 14,
}

impl ServerCode {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => ServerCode::Hello,
            1 => ServerCode::Data,
            2 => ServerCode::Exception,
            3 => ServerCode::Progress,
            4 => ServerCode::Pong,
            5 => ServerCode::EndOfStream,
            6 => ServerCode::ProfileInfo,
            7 => ServerCode::Totals,
            8 => ServerCode::Extremes,
            9 => ServerCode::TablesStatusResponse,
            10 => ServerCode::Log,
            11 => ServerCode::TableColumns,
            12 => ServerCode::PartUuids,
            13 => ServerCode::ReadTaskRequest,
            14 => ServerCode::ProfileEvents,
            _ => return None,
        })
    }

    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let code = r.varint().await?;
        Self::from_u64(code).ok_or_else(|| DecodeError::UnknownPacket { code }.into())
    }

    pub fn encode(self, buf: &mut Buffer) {
        buf.put_varint(self as u64);
    }

    pub fn name(self) -> &'static str {
        match self {
            ServerCode::Hello => "Hello",
            ServerCode::Data => "Data",
            ServerCode::Exception => "Exception",
            ServerCode::Progress => "Progress",
            ServerCode::Pong => "Pong",
            ServerCode::EndOfStream => "EndOfStream",
            ServerCode::ProfileInfo => "ProfileInfo",
            ServerCode::Totals => "Totals",
            ServerCode::Extremes => "Extremes",
            ServerCode::TablesStatusResponse => "TablesStatusResponse",
            ServerCode::Log => "Log",
            ServerCode::TableColumns => "TableColumns",
            ServerCode::PartUuids => "PartUUIDs",
            ServerCode::ReadTaskRequest => "ReadTaskRequest",
            ServerCode::ProfileEvents => "ProfileEvents",
        }
    }

    /// Whether the packet's block travels in compressed frames when
    /// compression is on. Log and ProfileEvents blocks never do.
    pub fn compressible(self) -> bool {
        matches!(
            self,
            ServerCode::Data | ServerCode::Totals | ServerCode::Extremes
        )
    }
}

impl fmt::Display for ServerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ==================== HANDSHAKE ====================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHello {
    pub name: String,
    pub major: u64,
    pub minor: u64,
    pub revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ClientHello {
    pub fn encode(&self, buf: &mut Buffer) {
        ClientCode::Hello.encode(buf);
        buf.put_string(&self.name);
        buf.put_varint(self.major);
        buf.put_varint(self.minor);
        buf.put_varint(self.revision);
        buf.put_string(&self.database);
        buf.put_string(&self.user);
        buf.put_string(&self.password);
    }

    /// Body only; the packet code is already consumed.
    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.str().await?,
            major: r.varint().await?,
            minor: r.varint().await?,
            revision: r.varint().await?,
            database: r.str().await?,
            user: r.str().await?,
            password: r.str().await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerHello {
    pub name: String,
    pub major: u64,
    pub minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub patch: Option<u64>,
}

impl ServerHello {
    /// Optional fields are gated on the lower of both revisions.
    pub fn encode(&self, buf: &mut Buffer, client_revision: u64) {
        let rev = self.revision.min(client_revision);
        ServerCode::Hello.encode(buf);
        buf.put_string(&self.name);
        buf.put_varint(self.major);
        buf.put_varint(self.minor);
        buf.put_varint(self.revision);
        if Feature::ServerTimezone.supported(rev) {
            buf.put_string(self.timezone.as_deref().unwrap_or_default());
        }
        if Feature::DisplayName.supported(rev) {
            buf.put_string(self.display_name.as_deref().unwrap_or_default());
        }
        if Feature::VersionPatch.supported(rev) {
            buf.put_varint(self.patch.unwrap_or_default());
        }
    }

    /// Body only. `client_revision` is what the client announced.
    pub async fn decode(r: &mut Reader<'_>, client_revision: u64) -> Result<Self> {
        let name = r.str().await?;
        let major = r.varint().await?;
        let minor = r.varint().await?;
        let revision = r.varint().await?;
        let rev = revision.min(client_revision);

        let timezone = if Feature::ServerTimezone.supported(rev) {
            Some(r.str().await?)
        } else {
            None
        };
        let display_name = if Feature::DisplayName.supported(rev) {
            Some(r.str().await?)
        } else {
            None
        };
        let patch = if Feature::VersionPatch.supported(rev) {
            Some(r.varint().await?)
        } else {
            None
        };
        Ok(Self {
            name,
            major,
            minor,
            revision,
            timezone,
            display_name,
            patch,
        })
    }
}

// ==================== QUERY ====================

/// Query kind in `ClientInfo`.
pub const QUERY_KIND_INITIAL: u8 = 1;
/// Interface in `ClientInfo`.
pub const INTERFACE_TCP: u8 = 1;

/// Span context forwarded to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub flags: u8,
}

impl TraceContext {
    fn encode(&self, state: &str, buf: &mut Buffer) {
        buf.put_u64((self.trace_id >> 64) as u64);
        buf.put_u64(self.trace_id as u64);
        buf.put_u64(self.span_id);
        buf.put_string(state);
        buf.put_u8(self.flags);
    }
}

/// Who is asking, as carried inside the query packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub query_kind: u8,
    pub initial_user: String,
    pub initial_query_id: String,
    pub initial_address: String,
    /// Microseconds since the epoch.
    pub initial_time: i64,
    pub interface: u8,
    pub os_user: String,
    pub client_hostname: String,
    pub client_name: String,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub revision: u64,
    pub quota_key: String,
    pub distributed_depth: u64,
    pub trace: Option<TraceContext>,
    pub trace_state: String,
    pub collaborate_with_initiator: u64,
    pub count_participating_replicas: u64,
    pub number_of_current_replica: u64,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            query_kind: QUERY_KIND_INITIAL,
            initial_user: String::new(),
            initial_query_id: String::new(),
            initial_address: "0.0.0.0:0".to_string(),
            initial_time: 0,
            interface: INTERFACE_TCP,
            os_user: String::new(),
            client_hostname: String::new(),
            client_name: String::new(),
            major: 0,
            minor: 0,
            patch: 0,
            revision: 0,
            quota_key: String::new(),
            distributed_depth: 0,
            trace: None,
            trace_state: String::new(),
            collaborate_with_initiator: 0,
            count_participating_replicas: 0,
            number_of_current_replica: 0,
        }
    }
}

impl ClientInfo {
    pub fn encode(&self, buf: &mut Buffer, revision: u64) {
        buf.put_u8(self.query_kind);
        buf.put_string(&self.initial_user);
        buf.put_string(&self.initial_query_id);
        buf.put_string(&self.initial_address);
        if Feature::QueryStartTime.supported(revision) {
            buf.put_i64(self.initial_time);
        }
        buf.put_u8(self.interface);
        buf.put_string(&self.os_user);
        buf.put_string(&self.client_hostname);
        buf.put_string(&self.client_name);
        buf.put_varint(self.major);
        buf.put_varint(self.minor);
        buf.put_varint(self.revision);
        if Feature::QuotaKeyInClientInfo.supported(revision) {
            buf.put_string(&self.quota_key);
        }
        if Feature::DistributedDepth.supported(revision) {
            buf.put_varint(self.distributed_depth);
        }
        if Feature::VersionPatch.supported(revision) {
            buf.put_varint(self.patch);
        }
        if Feature::OpenTelemetry.supported(revision) {
            match &self.trace {
                Some(t) => {
                    buf.put_bool(true);
                    t.encode(&self.trace_state, buf);
                }
                None => buf.put_bool(false),
            }
        }
        if Feature::ParallelReplicas.supported(revision) {
            buf.put_varint(self.collaborate_with_initiator);
            buf.put_varint(self.count_participating_replicas);
            buf.put_varint(self.number_of_current_replica);
        }
    }

    pub async fn decode(r: &mut Reader<'_>, revision: u64) -> Result<Self> {
        let mut c = ClientInfo {
            query_kind: r.u8().await?,
            initial_user: r.str().await?,
            initial_query_id: r.str().await?,
            initial_address: r.str().await?,
            ..ClientInfo::default()
        };
        if Feature::QueryStartTime.supported(revision) {
            c.initial_time = r.i64().await?;
        }
        c.interface = r.u8().await?;
        c.os_user = r.str().await?;
        c.client_hostname = r.str().await?;
        c.client_name = r.str().await?;
        c.major = r.varint().await?;
        c.minor = r.varint().await?;
        c.revision = r.varint().await?;
        if Feature::QuotaKeyInClientInfo.supported(revision) {
            c.quota_key = r.str().await?;
        }
        if Feature::DistributedDepth.supported(revision) {
            c.distributed_depth = r.varint().await?;
        }
        if Feature::VersionPatch.supported(revision) {
            c.patch = r.varint().await?;
        }
        if Feature::OpenTelemetry.supported(revision) && r.bool().await? {
            let hi = r.u64().await?;
            let lo = r.u64().await?;
            let span_id = r.u64().await?;
            c.trace_state = r.str().await?;
            let flags = r.u8().await?;
            c.trace = Some(TraceContext {
                trace_id: ((hi as u128) << 64) | lo as u128,
                span_id,
                flags,
            });
        }
        if Feature::ParallelReplicas.supported(revision) {
            c.collaborate_with_initiator = r.varint().await?;
            c.count_participating_replicas = r.varint().await?;
            c.number_of_current_replica = r.varint().await?;
        }
        Ok(c)
    }
}

const SETTING_IMPORTANT: u64 = 0x01;
const SETTING_CUSTOM: u64 = 0x02;

/// One query setting, passed through as strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub important: bool,
    pub custom: bool,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Servers that do not know an important setting fail the query instead of
    /// ignoring it.
    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }

    fn encode(&self, buf: &mut Buffer) {
        buf.put_string(&self.key);
        let mut flags = 0;
        if self.important {
            flags |= SETTING_IMPORTANT;
        }
        if self.custom {
            flags |= SETTING_CUSTOM;
        }
        buf.put_varint(flags);
        buf.put_string(&self.value);
    }

    /// Decode settings up to the empty-key terminator.
    async fn decode_list(r: &mut Reader<'_>) -> Result<Vec<Setting>> {
        let mut out = Vec::new();
        loop {
            let key = r.str().await?;
            if key.is_empty() {
                return Ok(out);
            }
            let flags = r.varint().await?;
            out.push(Setting {
                key,
                important: flags & SETTING_IMPORTANT != 0,
                custom: flags & SETTING_CUSTOM != 0,
                value: r.str().await?,
            });
        }
    }
}

/// A query parameter. Sent as a custom setting holding a quoted literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn as_setting(&self) -> Setting {
        Setting {
            key: self.key.clone(),
            value: quote(&self.value),
            important: false,
            custom: true,
        }
    }
}

/// How far the server should process the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    FetchColumns = 0,
    WithMergeableState = 1,
    #[default]
    Complete = 2,
}

impl Stage {
    fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Stage::FetchColumns),
            1 => Some(Stage::WithMergeableState),
            2 => Some(Stage::Complete),
            _ => None,
        }
    }
}

/// The query packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryPacket {
    pub id: String,
    pub info: ClientInfo,
    pub settings: Vec<Setting>,
    pub secret: String,
    pub stage: Stage,
    pub compression: bool,
    pub body: String,
    pub parameters: Vec<Parameter>,
}

impl QueryPacket {
    pub fn encode(&self, buf: &mut Buffer, revision: u64) {
        ClientCode::Query.encode(buf);
        buf.put_string(&self.id);
        if Feature::ClientInfo.supported(revision) {
            self.info.encode(buf, revision);
        }
        if Feature::SettingsAsStrings.supported(revision) {
            for s in &self.settings {
                s.encode(buf);
            }
        } else if !self.settings.is_empty() {
            tracing::warn!(
                revision,
                count = self.settings.len(),
                "server revision predates string settings; settings not sent"
            );
        }
        buf.put_string("");
        if Feature::InterServerSecret.supported(revision) {
            buf.put_string(&self.secret);
        }
        buf.put_varint(self.stage as u64);
        buf.put_varint(u64::from(self.compression));
        buf.put_string(&self.body);
        if Feature::Parameters.supported(revision) {
            for p in &self.parameters {
                p.as_setting().encode(buf);
            }
            buf.put_string("");
        }
    }

    /// Body only; the packet code is already consumed.
    pub async fn decode(r: &mut Reader<'_>, revision: u64) -> Result<Self> {
        let id = r.str().await?;
        let info = if Feature::ClientInfo.supported(revision) {
            ClientInfo::decode(r, revision).await?
        } else {
            ClientInfo::default()
        };
        let settings = if Feature::SettingsAsStrings.supported(revision) {
            Setting::decode_list(r).await?
        } else {
            let terminator = r.str().await?;
            if !terminator.is_empty() {
                return Err(DecodeError::invalid("binary settings are not supported").into());
            }
            Vec::new()
        };
        let secret = if Feature::InterServerSecret.supported(revision) {
            r.str().await?
        } else {
            String::new()
        };
        let stage_code = r.varint().await?;
        let stage = Stage::from_u64(stage_code)
            .ok_or_else(|| DecodeError::invalid(format!("unknown query stage {}", stage_code)))?;
        let compression = r.varint().await? != 0;
        let body = r.str().await?;
        let parameters = if Feature::Parameters.supported(revision) {
            Setting::decode_list(r)
                .await?
                .into_iter()
                .map(|s| Parameter {
                    key: s.key,
                    value: s.value,
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            id,
            info,
            settings,
            secret,
            stage,
            compression,
            body,
            parameters,
        })
    }
}

// ==================== SERVER BODIES ====================

/// Error reported by the server. The connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Exception {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack: String,
    pub nested: Option<Box<Exception>>,
}

impl Exception {
    pub fn encode(&self, buf: &mut Buffer) {
        buf.put_i32(self.code);
        buf.put_string(&self.name);
        buf.put_string(&self.message);
        buf.put_string(&self.stack);
        buf.put_bool(self.nested.is_some());
        if let Some(n) = &self.nested {
            n.encode(buf);
        }
    }

    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mut chain = Vec::new();
        loop {
            let e = Exception {
                code: r.i32().await?,
                name: r.str().await?,
                message: r.str().await?,
                stack: r.str().await?,
                nested: None,
            };
            let has_nested = r.bool().await?;
            chain.push(e);
            if !has_nested {
                break;
            }
            if chain.len() >= MAX_EXCEPTION_DEPTH {
                return Err(DecodeError::Bound {
                    what: "nested exceptions",
                    value: chain.len() as u64 + 1,
                    max: MAX_EXCEPTION_DEPTH as u64,
                }
                .into());
            }
        }
        let mut out: Option<Exception> = None;
        while let Some(mut e) = chain.pop() {
            e.nested = out.take().map(Box::new);
            out = Some(e);
        }
        out.ok_or_else(|| Error::Protocol("empty exception".to_string()))
    }

    /// Outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Exception> + '_ {
        std::iter::successors(Some(self), |e| e.nested.as_deref())
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.code, self.message)?;
        if let Some(n) = &self.nested {
            write!(f, "; caused by {}", n)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub wrote_rows: u64,
    pub wrote_bytes: u64,
    pub elapsed_ns: u64,
}

impl Progress {
    pub fn encode(&self, buf: &mut Buffer, revision: u64) {
        buf.put_varint(self.rows);
        buf.put_varint(self.bytes);
        buf.put_varint(self.total_rows);
        if Feature::ClientWriteInfo.supported(revision) {
            buf.put_varint(self.wrote_rows);
            buf.put_varint(self.wrote_bytes);
        }
        if Feature::ServerQueryTimeInProgress.supported(revision) {
            buf.put_varint(self.elapsed_ns);
        }
    }

    pub async fn decode(r: &mut Reader<'_>, revision: u64) -> Result<Self> {
        let mut p = Progress {
            rows: r.varint().await?,
            bytes: r.varint().await?,
            total_rows: r.varint().await?,
            ..Progress::default()
        };
        if Feature::ClientWriteInfo.supported(revision) {
            p.wrote_rows = r.varint().await?;
            p.wrote_bytes = r.varint().await?;
        }
        if Feature::ServerQueryTimeInProgress.supported(revision) {
            p.elapsed_ns = r.varint().await?;
        }
        Ok(p)
    }

    /// Progress packets carry deltas; the server-side elapsed time is absolute.
    pub fn add(&mut self, other: &Progress) {
        self.rows += other.rows;
        self.bytes += other.bytes;
        self.total_rows += other.total_rows;
        self.wrote_rows += other.wrote_rows;
        self.wrote_bytes += other.wrote_bytes;
        self.elapsed_ns = self.elapsed_ns.max(other.elapsed_ns);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    pub fn encode(&self, buf: &mut Buffer) {
        buf.put_varint(self.rows);
        buf.put_varint(self.blocks);
        buf.put_varint(self.bytes);
        buf.put_bool(self.applied_limit);
        buf.put_varint(self.rows_before_limit);
        buf.put_bool(self.calculated_rows_before_limit);
    }

    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            rows: r.varint().await?,
            blocks: r.varint().await?,
            bytes: r.varint().await?,
            applied_limit: r.bool().await?,
            rows_before_limit: r.varint().await?,
            calculated_rows_before_limit: r.bool().await?,
        })
    }
}

/// Column descriptions the server sends ahead of an insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableColumns {
    pub first: String,
    pub second: String,
}

impl TableColumns {
    pub async fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            first: r.str().await?,
            second: r.str().await?,
        })
    }
}

/// Data, Totals, Extremes, Log and ProfileEvents share one layout: code,
/// temporary table name, block. With `framing`, only the block goes into
/// compressed frames. Nothing is left in `buf` on error.
pub fn encode_data_packet(
    buf: &mut Buffer,
    code: u64,
    revision: u64,
    framing: Option<(Method, i32)>,
    columns: &mut [NamedColumn],
) -> Result<usize> {
    let start = buf.len();
    buf.put_varint(code);
    buf.put_string("");
    let encoded = match framing {
        None => Block::encode(buf, revision, &BlockInfo::default(), columns),
        Some((method, level)) => {
            let mut block = Buffer::new();
            Block::encode(&mut block, revision, &BlockInfo::default(), columns).and_then(|rows| {
                encode_frames(method, level, block.as_slice(), buf)?;
                Ok(rows)
            })
        }
    };
    if encoded.is_err() {
        buf.buf.truncate(start);
    }
    encoded
}

/// Read and discard a PartUUIDs body. Returns how many were listed.
pub async fn skip_part_uuids(r: &mut Reader<'_>) -> Result<usize> {
    let n = r.varint_bounded("part UUIDs", MAX_PART_UUIDS).await?;
    let mut uuid = [0u8; 16];
    for _ in 0..n {
        r.read_full(&mut uuid).await?;
    }
    Ok(n)
}

// ==================== LOG AND PROFILE EVENT BLOCKS ====================

fn required<'a, T: Column + 'static>(res: &'a Results, block: &str, name: &str) -> Result<&'a T> {
    res.get::<T>(name).ok_or_else(|| {
        Error::Protocol(format!(
            "{} block has no column {:?} of the expected type",
            block, name
        ))
    })
}

fn str_at(c: &ColStr, row: usize) -> String {
    c.get(row)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

/// One server log line, from a `Log` packet block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogLine {
    /// Seconds since the epoch.
    pub time: u32,
    pub time_micros: u32,
    pub host: String,
    pub query_id: String,
    pub thread_id: u64,
    pub priority: i8,
    pub source: String,
    pub text: String,
}

impl LogLine {
    pub fn from_results(res: &Results) -> Result<Vec<LogLine>> {
        if res.is_empty() {
            return Ok(Vec::new());
        }
        let time = required::<ColUInt32>(res, "Log", "event_time")?;
        let micros = required::<ColUInt32>(res, "Log", "event_time_microseconds")?;
        let host = required::<ColStr>(res, "Log", "host_name")?;
        let query_id = required::<ColStr>(res, "Log", "query_id")?;
        let thread = required::<ColUInt64>(res, "Log", "thread_id")?;
        let priority = required::<ColInt8>(res, "Log", "priority")?;
        let source = required::<ColStr>(res, "Log", "source")?;
        let text = required::<ColStr>(res, "Log", "text")?;
        Ok((0..res.rows())
            .map(|i| LogLine {
                time: time.get(i).unwrap_or_default(),
                time_micros: micros.get(i).unwrap_or_default(),
                host: str_at(host, i),
                query_id: str_at(query_id, i),
                thread_id: thread.get(i).unwrap_or_default(),
                priority: priority.get(i).unwrap_or_default(),
                source: str_at(source, i),
                text: str_at(text, i),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileEventKind {
    Increment,
    Gauge,
    Other(i8),
}

impl From<i8> for ProfileEventKind {
    fn from(v: i8) -> Self {
        match v {
            1 => ProfileEventKind::Increment,
            2 => ProfileEventKind::Gauge,
            other => ProfileEventKind::Other(other),
        }
    }
}

/// One counter from a `ProfileEvents` packet block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEvent {
    pub host: String,
    pub time: u32,
    pub thread_id: u64,
    pub kind: ProfileEventKind,
    pub name: String,
    pub value: i64,
}

impl ProfileEvent {
    /// `value` is Int64 on current servers and UInt64 on older ones.
    pub fn from_results(res: &Results) -> Result<Vec<ProfileEvent>> {
        if res.is_empty() {
            return Ok(Vec::new());
        }
        let host = required::<ColStr>(res, "ProfileEvents", "host_name")?;
        let time = required::<ColUInt32>(res, "ProfileEvents", "current_time")?;
        let thread = required::<ColUInt64>(res, "ProfileEvents", "thread_id")?;
        let kind = required::<ColInt8>(res, "ProfileEvents", "type")?;
        let name = required::<ColStr>(res, "ProfileEvents", "name")?;
        let value: Box<dyn Fn(usize) -> i64 + '_> = match res.get::<ColInt64>("value") {
            Some(c) => Box::new(move |i| c.get(i).unwrap_or_default()),
            None => {
                let c = required::<ColUInt64>(res, "ProfileEvents", "value")?;
                Box::new(move |i| c.get(i).unwrap_or_default() as i64)
            }
        };
        Ok((0..res.rows())
            .map(|i| ProfileEvent {
                host: str_at(host, i),
                time: time.get(i).unwrap_or_default(),
                thread_id: thread.get(i).unwrap_or_default(),
                kind: kind.get(i).unwrap_or_default().into(),
                name: str_at(name, i),
                value: value(i),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColFixed, NamedColumn};
    use crate::protocol::block::{Block, BlockInfo, DecodeLimits};
    use crate::protocol::feature::CLIENT_REVISION;
    use pretty_assertions::assert_eq;

    fn sample_query() -> QueryPacket {
        QueryPacket {
            id: "q-1".to_string(),
            info: ClientInfo {
                client_name: "ch-native".to_string(),
                major: 1,
                minor: 2,
                revision: CLIENT_REVISION,
                quota_key: "quota".to_string(),
                trace: Some(TraceContext {
                    trace_id: 0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10,
                    span_id: 42,
                    flags: 1,
                }),
                trace_state: "k=v".to_string(),
                ..ClientInfo::default()
            },
            settings: vec![Setting::new("max_threads", "4").important()],
            body: "SELECT {x:String}".to_string(),
            parameters: vec![Parameter::new("x", "it's")],
            compression: true,
            ..QueryPacket::default()
        }
    }

    async fn decode_query(bytes: &[u8], revision: u64) -> QueryPacket {
        let mut r = Reader::from_slice(bytes);
        assert_eq!(r.varint().await.unwrap(), ClientCode::Query as u64);
        let q = QueryPacket::decode(&mut r, revision).await.unwrap();
        assert!(r.at_eof().await.unwrap());
        q
    }

    #[tokio::test]
    async fn test_query_packet_current_revision() {
        let q = sample_query();
        let mut b = Buffer::new();
        q.encode(&mut b, CLIENT_REVISION);
        let got = decode_query(b.as_slice(), CLIENT_REVISION).await;
        assert_eq!(got.parameters, vec![Parameter::new("x", "'it\\'s'")]);
        assert_eq!(got.settings, q.settings);
        assert_eq!(got.info, q.info);
        assert_eq!(got.body, q.body);
        assert!(got.compression);
        assert_eq!(got.stage, Stage::Complete);
    }

    #[tokio::test]
    async fn test_query_packet_gates_follow_revision() {
        let q = sample_query();
        let mut current = Buffer::new();
        q.encode(&mut current, CLIENT_REVISION);

        // Before OpenTelemetry: no span context, no parallel replica fields.
        let rev = Feature::InterServerSecret.revision();
        let mut older = Buffer::new();
        q.encode(&mut older, rev);
        assert!(older.len() < current.len());
        let got = decode_query(older.as_slice(), rev).await;
        assert_eq!(got.info.trace, None);
        assert_eq!(got.info.quota_key, "quota");
        assert!(got.parameters.is_empty());

        // Before ClientInfo there is none at all.
        let mut ancient = Buffer::new();
        q.encode(&mut ancient, 5);
        let mut expect = Buffer::new();
        expect.put_varint(1);
        expect.put_string("q-1");
        expect.put_string("");
        expect.put_varint(2);
        expect.put_varint(1);
        expect.put_string("SELECT {x:String}");
        assert_eq!(ancient.as_slice(), expect.as_slice());
    }

    #[tokio::test]
    async fn test_trace_id_layout() {
        let info = ClientInfo {
            trace: Some(TraceContext {
                trace_id: (1u128 << 64) | 2,
                span_id: 3,
                flags: 1,
            }),
            ..ClientInfo::default()
        };
        let mut full = Buffer::new();
        info.encode(&mut full, Feature::OpenTelemetry.revision());
        let mut without = Buffer::new();
        ClientInfo { trace: None, ..info.clone() }.encode(&mut without, Feature::OpenTelemetry.revision());
        // Shared prefix up to the presence flag.
        let at = without.len() - 1;
        assert_eq!(&full.as_slice()[..at], &without.as_slice()[..at]);
        let tail = &full.as_slice()[at..];
        assert_eq!(tail[0], 1);
        assert_eq!(&tail[1..9], &1u64.to_le_bytes());
        assert_eq!(&tail[9..17], &2u64.to_le_bytes());
        assert_eq!(&tail[17..25], &3u64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_server_hello_gates() {
        let hello = ServerHello {
            name: "ClickHouse".to_string(),
            major: 23,
            minor: 8,
            revision: 54441,
            timezone: Some("UTC".to_string()),
            display_name: Some("node-1".to_string()),
            patch: Some(3),
        };
        let mut b = Buffer::new();
        hello.encode(&mut b, CLIENT_REVISION);
        let mut r = Reader::from_slice(b.as_slice());
        assert_eq!(ServerCode::decode(&mut r).await.unwrap(), ServerCode::Hello);
        assert_eq!(ServerHello::decode(&mut r, CLIENT_REVISION).await.unwrap(), hello);

        let old = ServerHello {
            revision: 54000,
            timezone: None,
            display_name: None,
            patch: None,
            ..hello
        };
        let mut b = Buffer::new();
        old.encode(&mut b, CLIENT_REVISION);
        let mut r = Reader::from_slice(b.as_slice());
        ServerCode::decode(&mut r).await.unwrap();
        assert_eq!(ServerHello::decode(&mut r, CLIENT_REVISION).await.unwrap(), old);
        assert!(r.at_eof().await.unwrap());
    }

    #[tokio::test]
    async fn test_client_hello_round_trip() {
        let hello = ClientHello {
            name: "ch-native".to_string(),
            major: 0,
            minor: 1,
            revision: CLIENT_REVISION,
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
        };
        let mut b = Buffer::new();
        hello.encode(&mut b);
        let mut r = Reader::from_slice(b.as_slice());
        assert_eq!(r.varint().await.unwrap(), 0);
        assert_eq!(ClientHello::decode(&mut r).await.unwrap(), hello);
    }

    #[tokio::test]
    async fn test_nested_exception() {
        let e = Exception {
            code: 60,
            name: "DB::Exception".to_string(),
            message: "Table default.x does not exist".to_string(),
            stack: "0. frame".to_string(),
            nested: Some(Box::new(Exception {
                code: 1000,
                name: "Poco::Exception".to_string(),
                ..Exception::default()
            })),
        };
        let mut b = Buffer::new();
        e.encode(&mut b);
        let got = Exception::decode(&mut Reader::from_slice(b.as_slice())).await.unwrap();
        assert_eq!(got, e);
        assert_eq!(got.chain().count(), 2);
        assert!(got.to_string().starts_with("DB::Exception (60): Table default.x"));
    }

    #[tokio::test]
    async fn test_progress_accumulates() {
        let p = Progress {
            rows: 10,
            bytes: 80,
            total_rows: 100,
            wrote_rows: 1,
            wrote_bytes: 8,
            elapsed_ns: 500,
        };
        let mut b = Buffer::new();
        p.encode(&mut b, CLIENT_REVISION);
        let got = Progress::decode(&mut Reader::from_slice(b.as_slice()), CLIENT_REVISION)
            .await
            .unwrap();
        assert_eq!(got, p);

        let mut total = Progress::default();
        total.add(&got);
        total.add(&got);
        assert_eq!(total.rows, 20);
        assert_eq!(total.elapsed_ns, 500);

        let mut old = Buffer::new();
        p.encode(&mut old, Feature::ServerLogs.revision());
        assert_eq!(old.len(), 3);
    }

    #[tokio::test]
    async fn test_part_uuids_skipped() {
        let mut b = Buffer::new();
        b.put_varint(2);
        b.put_raw(&[7u8; 32]);
        b.put_u8(0xaa);
        let mut r = Reader::from_slice(b.as_slice());
        assert_eq!(skip_part_uuids(&mut r).await.unwrap(), 2);
        assert_eq!(r.u8().await.unwrap(), 0xaa);
    }

    #[tokio::test]
    async fn test_unknown_packet_code() {
        let err = ServerCode::decode(&mut Reader::from_slice(&[99])).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(DecodeError::UnknownPacket { code: 99 })
        ));
    }

    #[tokio::test]
    async fn test_log_lines_from_block() {
        let mut cols = vec![
            NamedColumn::new("event_time", ColFixed::<u32>::date_time(None).with_values([1_700_000_000])),
            NamedColumn::new("event_time_microseconds", ColUInt32::from_values([12])),
            NamedColumn::new("host_name", ColStr::from_values(["h"])),
            NamedColumn::new("query_id", ColStr::from_values(["q"])),
            NamedColumn::new("thread_id", ColUInt64::from_values([7])),
            NamedColumn::new("priority", ColInt8::from_values([6])),
            NamedColumn::new("source", ColStr::from_values(["executeQuery"])),
            NamedColumn::new("text", ColStr::from_values(["Read 1 rows"])),
        ];
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut cols).unwrap();
        let mut res = Results::auto();
        Block::decode(
            &mut Reader::from_slice(b.as_slice()),
            CLIENT_REVISION,
            &DecodeLimits::default(),
            &mut res,
        )
        .await
        .unwrap();
        let lines = LogLine::from_results(&res).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].time, 1_700_000_000);
        assert_eq!(lines[0].priority, 6);
        assert_eq!(lines[0].text, "Read 1 rows");
        assert!(LogLine::from_results(&Results::auto()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_events_accept_unsigned_values() {
        let mut cols = vec![
            NamedColumn::new("host_name", ColStr::from_values(["h", "h"])),
            NamedColumn::new("current_time", ColFixed::<u32>::date_time(None).with_values([1, 1])),
            NamedColumn::new("thread_id", ColUInt64::from_values([0, 0])),
            NamedColumn::new("type", ColInt8::from_values([1, 2])),
            NamedColumn::new("name", ColStr::from_values(["SelectedRows", "MemoryTracking"])),
            NamedColumn::new("value", ColUInt64::from_values([10, 4096])),
        ];
        let mut b = Buffer::new();
        Block::encode(&mut b, CLIENT_REVISION, &BlockInfo::default(), &mut cols).unwrap();
        let mut res = Results::auto();
        Block::decode(
            &mut Reader::from_slice(b.as_slice()),
            CLIENT_REVISION,
            &DecodeLimits::default(),
            &mut res,
        )
        .await
        .unwrap();
        let events = ProfileEvent::from_results(&res).unwrap();
        assert_eq!(events[0].kind, ProfileEventKind::Increment);
        assert_eq!(events[1].kind, ProfileEventKind::Gauge);
        assert_eq!(events[1].value, 4096);
        assert_eq!(events[1].name, "MemoryTracking");
    }

    #[tokio::test]
    async fn test_framed_data_packet() {
        let mut cols = vec![NamedColumn::new("s", ColStr::from_values(["a"; 100]))];
        let mut b = Buffer::new();
        let rows = encode_data_packet(
            &mut b,
            ClientCode::Data as u64,
            CLIENT_REVISION,
            Some((Method::Lz4, 0)),
            &mut cols,
        )
        .unwrap();
        assert_eq!(rows, 100);

        let mut r = Reader::from_slice(b.as_slice());
        assert_eq!(r.varint().await.unwrap(), ClientCode::Data as u64);
        assert_eq!(r.str().await.unwrap(), "");
        r.enable_compression(true);
        let mut res = Results::auto();
        Block::decode(&mut r, CLIENT_REVISION, &DecodeLimits::default(), &mut res)
            .await
            .unwrap();
        r.disable_compression();
        assert!(r.at_eof().await.unwrap());
        assert_eq!(res.get::<ColStr>("s").unwrap().get_str(99), Some("a"));
    }

    #[test]
    fn test_data_packet_error_leaves_buffer() {
        let mut cols = vec![
            NamedColumn::new("a", ColUInt64::from_values([1])),
            NamedColumn::new("b", ColUInt64::new()),
        ];
        let mut b = Buffer::new();
        b.put_u8(9);
        assert!(encode_data_packet(&mut b, 2, CLIENT_REVISION, None, &mut cols).is_err());
        assert_eq!(b.as_slice(), &[9]);
    }
}
