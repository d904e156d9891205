//! Query execution: the send phase, then the receive loop.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::cancel::CancelSignal;
use super::connection::{Client, State};
use super::io::guarded;
use crate::column::NamedColumn;
use crate::error::{Error, Result};
use crate::protocol::block::{Block, Results};
use crate::protocol::packet::{
    ClientInfo, Exception, LogLine, Parameter, ProfileEvent, ProfileInfo, Progress,
    QueryPacket, ServerCode, Setting, Stage, TableColumns, TraceContext, skip_part_uuids,
};

type Hook<'a, T> = Box<dyn FnMut(&T) -> Result<()> + Send + 'a>;
type ListHook<'a, T> = Box<dyn FnMut(&[T]) -> Result<()> + Send + 'a>;
type InputHook<'a> = Box<dyn FnMut(&mut [NamedColumn]) -> Result<bool> + Send + 'a>;

/// One query: SQL text, optional input columns, result targets and hooks.
///
/// Without explicit targets the result columns are inferred from the first
/// block. Each data block replaces the rows of the previous one; use
/// `on_result` to see every block.
pub struct Query<'a> {
    body: String,
    id: String,
    settings: Vec<Setting>,
    parameters: Vec<Parameter>,
    secret: String,
    trace: Option<(TraceContext, String)>,
    input: Vec<NamedColumn>,
    result: Results,
    cancel: Option<CancelSignal>,
    on_input: Option<InputHook<'a>>,
    on_result: Option<Hook<'a, Results>>,
    on_progress: Option<Hook<'a, Progress>>,
    on_profile: Option<Hook<'a, ProfileInfo>>,
    on_logs: Option<ListHook<'a, LogLine>>,
    on_profile_events: Option<ListHook<'a, ProfileEvent>>,
    on_totals: Option<Hook<'a, Results>>,
    on_extremes: Option<Hook<'a, Results>>,
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("body", &self.body)
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("parameters", &self.parameters)
            .field("input", &self.input.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Query<'a> {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            id: String::new(),
            settings: Vec::new(),
            parameters: Vec::new(),
            secret: String::new(),
            trace: None,
            input: Vec::new(),
            result: Results::auto(),
            cancel: None,
            on_input: None,
            on_result: None,
            on_progress: None,
            on_profile: None,
            on_logs: None,
            on_profile_events: None,
            on_totals: None,
            on_extremes: None,
        }
    }

    /// Query id; the server assigns one when empty.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn setting(mut self, setting: Setting) -> Self {
        self.settings.push(setting);
        self
    }

    pub fn settings(mut self, settings: impl IntoIterator<Item = Setting>) -> Self {
        self.settings.extend(settings);
        self
    }

    /// Bind `{key:Type}` in the query text.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(key, value));
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn trace(mut self, ctx: TraceContext, state: impl Into<String>) -> Self {
        self.trace = Some((ctx, state.into()));
        self
    }

    /// Columns sent as the first input block.
    pub fn input(mut self, columns: Vec<NamedColumn>) -> Self {
        self.input = columns;
        self
    }

    /// Explicit result targets, positional.
    pub fn result(mut self, result: Results) -> Self {
        self.result = result;
        self
    }

    pub fn cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Refill the (reset) input columns for the next block. Return `false`
    /// when there is nothing more to send.
    pub fn on_input(
        mut self,
        f: impl FnMut(&mut [NamedColumn]) -> Result<bool> + Send + 'a,
    ) -> Self {
        self.on_input = Some(Box::new(f));
        self
    }

    /// Called for every data block that has rows.
    pub fn on_result(mut self, f: impl FnMut(&Results) -> Result<()> + Send + 'a) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(&Progress) -> Result<()> + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_profile(mut self, f: impl FnMut(&ProfileInfo) -> Result<()> + Send + 'a) -> Self {
        self.on_profile = Some(Box::new(f));
        self
    }

    pub fn on_logs(mut self, f: impl FnMut(&[LogLine]) -> Result<()> + Send + 'a) -> Self {
        self.on_logs = Some(Box::new(f));
        self
    }

    pub fn on_profile_events(
        mut self,
        f: impl FnMut(&[ProfileEvent]) -> Result<()> + Send + 'a,
    ) -> Self {
        self.on_profile_events = Some(Box::new(f));
        self
    }

    pub fn on_totals(mut self, f: impl FnMut(&Results) -> Result<()> + Send + 'a) -> Self {
        self.on_totals = Some(Box::new(f));
        self
    }

    pub fn on_extremes(mut self, f: impl FnMut(&Results) -> Result<()> + Send + 'a) -> Self {
        self.on_extremes = Some(Box::new(f));
        self
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Result targets holding the last data block.
    pub fn results(&self) -> &Results {
        &self.result
    }

    pub fn into_results(self) -> Results {
        self.result
    }
}

/// Counters for one finished query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub blocks: usize,
    pub rows: usize,
    pub input_blocks: usize,
    pub input_rows: usize,
    pub progress: Progress,
    pub profile: Option<ProfileInfo>,
    pub log_lines: usize,
}

/// Side targets for blocks that are not query results.
struct Scratch {
    totals: Results,
    extremes: Results,
    logs: Results,
    events: Results,
}

impl Scratch {
    fn new() -> Self {
        let mut s = Self {
            totals: Results::auto(),
            extremes: Results::auto(),
            logs: Results::auto(),
            events: Results::auto(),
        };
        for r in [&mut s.totals, &mut s.extremes, &mut s.logs, &mut s.events] {
            r.set_replace(true);
        }
        s
    }
}

enum Packet {
    Data(Block),
    Totals(Block),
    Extremes(Block),
    Progress(Progress),
    Profile(ProfileInfo),
    Logs(Vec<LogLine>),
    ProfileEvents(Vec<ProfileEvent>),
    Skipped,
    Exception(Exception),
    End,
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

impl Client {
    /// Run `q` to completion.
    ///
    /// A server exception comes back as `Error::Exception` and leaves the
    /// connection usable. Cancellation sends a best-effort Cancel packet and
    /// closes the connection.
    pub async fn query(&mut self, q: &mut Query<'_>) -> Result<QueryStats> {
        let mut cancel = q.cancel.take();
        let res = self.run(q, &mut cancel).await;
        q.cancel = cancel;
        res
    }

    fn client_info(&self, q: &Query<'_>) -> ClientInfo {
        let opts = self.options();
        let (trace, trace_state) = match &q.trace {
            Some((ctx, state)) => (Some(*ctx), state.clone()),
            None => (None, String::new()),
        };
        ClientInfo {
            initial_query_id: q.id.clone(),
            initial_time: now_micros(),
            os_user: std::env::var("USER").unwrap_or_default(),
            client_hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            client_name: opts.client_name.clone(),
            major: super::connection::VERSION_MAJOR,
            minor: super::connection::VERSION_MINOR,
            patch: super::connection::VERSION_PATCH,
            revision: opts.revision,
            quota_key: opts.quota_key.clone(),
            trace,
            trace_state,
            ..ClientInfo::default()
        }
    }

    async fn run(&mut self, q: &mut Query<'_>, cancel: &mut Option<CancelSignal>) -> Result<QueryStats> {
        self.ensure_idle()?;
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        let mut stats = QueryStats::default();

        // Query packet, end of external tables, first input block. Nothing is
        // on the wire yet, so a bad first block leaves the connection idle.
        self.buf.reset();
        let revision = self.revision();
        let packet = QueryPacket {
            id: q.id.clone(),
            info: self.client_info(q),
            settings: q.settings.clone(),
            secret: q.secret.clone(),
            stage: Stage::Complete,
            compression: self.framing().is_some(),
            body: q.body.clone(),
            parameters: q.parameters.clone(),
        };
        packet.encode(&mut self.buf, revision);
        let first = self
            .encode_data(&mut [])
            .and_then(|_| self.encode_input(&mut q.input, &mut stats));
        if let Err(e) = first {
            self.buf.reset();
            return Err(e);
        }

        self.state = State::QueryActive;
        tracing::debug!(
            id = %q.id,
            revision,
            input_columns = q.input.len(),
            "query started"
        );
        if let Err(e) = self.flush(cancel.as_mut()).await {
            return Err(self.fail(e).await);
        }

        if let Err(e) = self.send_input(q, &mut stats, cancel).await {
            return Err(self.fail(e).await);
        }

        let mut scratch = Scratch::new();
        q.result.set_replace(true);
        loop {
            let timeout = self.options().read_timeout;
            let received = guarded(
                self.recv_packet(&mut q.result, &mut scratch),
                "read",
                timeout,
                cancel.as_mut(),
            )
            .await;
            let packet = match received {
                Ok(p) => p,
                Err(e) => return Err(self.fail(e).await),
            };

            let hook = match packet {
                Packet::Data(block) => {
                    if !block.is_end() {
                        stats.blocks += 1;
                        stats.rows += block.rows;
                    }
                    match q.on_result.as_mut() {
                        Some(f) if block.rows > 0 => f(&q.result),
                        _ => Ok(()),
                    }
                }
                Packet::Totals(block) => match q.on_totals.as_mut() {
                    Some(f) if !block.is_end() => f(&scratch.totals),
                    _ => Ok(()),
                },
                Packet::Extremes(block) => match q.on_extremes.as_mut() {
                    Some(f) if !block.is_end() => f(&scratch.extremes),
                    _ => Ok(()),
                },
                Packet::Progress(p) => {
                    stats.progress.add(&p);
                    q.on_progress.as_mut().map_or(Ok(()), |f| f(&p))
                }
                Packet::Profile(p) => {
                    stats.profile = Some(p);
                    q.on_profile.as_mut().map_or(Ok(()), |f| f(&p))
                }
                Packet::Logs(lines) => {
                    stats.log_lines += lines.len();
                    match q.on_logs.as_mut() {
                        Some(f) if !lines.is_empty() => f(&lines),
                        _ => Ok(()),
                    }
                }
                Packet::ProfileEvents(events) => match q.on_profile_events.as_mut() {
                    Some(f) if !events.is_empty() => f(&events),
                    _ => Ok(()),
                },
                Packet::Skipped => Ok(()),
                Packet::Exception(e) => {
                    self.state = State::Idle;
                    tracing::debug!(id = %q.id, code = e.code, name = %e.name, "query failed");
                    return Err(e.into());
                }
                Packet::End => {
                    self.state = State::Idle;
                    tracing::debug!(
                        id = %q.id,
                        blocks = stats.blocks,
                        rows = stats.rows,
                        "query finished"
                    );
                    return Ok(stats);
                }
            };
            if let Err(e) = hook {
                return Err(self.fail(e).await);
            }
        }
    }

    /// Encode one input block if the columns hold rows.
    fn encode_input(&mut self, input: &mut [NamedColumn], stats: &mut QueryStats) -> Result<()> {
        if input.first().is_none_or(|c| c.data.rows() == 0) {
            return Ok(());
        }
        let rows = self.encode_data(input)?;
        stats.input_blocks += 1;
        stats.input_rows += rows;
        tracing::trace!(rows, "input block");
        Ok(())
    }

    /// Refill loop, then the end-of-input sentinel.
    async fn send_input(
        &mut self,
        q: &mut Query<'_>,
        stats: &mut QueryStats,
        cancel: &mut Option<CancelSignal>,
    ) -> Result<()> {
        if let Some(refill) = q.on_input.as_mut() {
            loop {
                if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                    return Err(Error::Cancelled);
                }
                for c in q.input.iter_mut() {
                    c.data.reset();
                }
                if !refill(&mut q.input)? {
                    break;
                }
                self.encode_input(&mut q.input, stats)?;
                self.flush(cancel.as_mut()).await?;
            }
        }
        if !q.input.is_empty() {
            self.encode_data(&mut [])?;
            self.flush(cancel.as_mut()).await?;
        }
        Ok(())
    }

    /// Read and decode one server packet. Hooks run outside, after the
    /// read deadline.
    async fn recv_packet(&mut self, result: &mut Results, scratch: &mut Scratch) -> Result<Packet> {
        let code = ServerCode::decode(&mut self.reader).await?;
        tracing::trace!(packet = %code, "received");
        let revision = self.revision();
        Ok(match code {
            ServerCode::Data => Packet::Data(self.read_block(code, result).await?),
            ServerCode::Totals => Packet::Totals(self.read_block(code, &mut scratch.totals).await?),
            ServerCode::Extremes => {
                Packet::Extremes(self.read_block(code, &mut scratch.extremes).await?)
            }
            ServerCode::Progress => Packet::Progress(Progress::decode(&mut self.reader, revision).await?),
            ServerCode::ProfileInfo => Packet::Profile(ProfileInfo::decode(&mut self.reader).await?),
            ServerCode::Log => {
                let block = self.read_block(code, &mut scratch.logs).await?;
                if block.is_end() {
                    Packet::Logs(Vec::new())
                } else {
                    Packet::Logs(LogLine::from_results(&scratch.logs)?)
                }
            }
            ServerCode::ProfileEvents => {
                let block = self.read_block(code, &mut scratch.events).await?;
                if block.is_end() {
                    Packet::ProfileEvents(Vec::new())
                } else {
                    Packet::ProfileEvents(ProfileEvent::from_results(&scratch.events)?)
                }
            }
            ServerCode::TableColumns => {
                let cols = TableColumns::decode(&mut self.reader).await?;
                tracing::debug!(columns = %cols.second, "table columns");
                Packet::Skipped
            }
            ServerCode::PartUuids => {
                let n = skip_part_uuids(&mut self.reader).await?;
                tracing::debug!(count = n, "part UUIDs ignored");
                Packet::Skipped
            }
            ServerCode::Exception => Packet::Exception(Exception::decode(&mut self.reader).await?),
            ServerCode::EndOfStream => Packet::End,
            ServerCode::Hello
            | ServerCode::Pong
            | ServerCode::TablesStatusResponse
            | ServerCode::ReadTaskRequest => {
                tracing::warn!(packet = %code, "unexpected packet during query");
                return Err(Error::Protocol(format!("unexpected {} packet during query", code)));
            }
        })
    }

    /// Best-effort Cancel, then close. Returns `err` for the caller.
    pub(crate) async fn fail(&mut self, err: Error) -> Error {
        if matches!(err, Error::Cancelled) {
            tracing::debug!("query cancelled");
        } else {
            tracing::debug!(error = %err, "query aborted");
        }
        if self.state == State::QueryActive {
            self.send_cancel().await;
        }
        self.shutdown().await;
        err
    }
}
