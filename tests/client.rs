//! Client integration tests against a scripted in-memory server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ch_native::column::{ColFixed, ColInt8, ColStr, ColUInt32, ColUInt64, ColUInt8};
use ch_native::protocol::packet::encode_data_packet;
use ch_native::protocol::{
    Block, Buffer, CLIENT_REVISION, ClientCode, ClientHello, DecodeLimits, Exception, Feature,
    Method, ProfileInfo, Progress, QueryPacket, Reader, ServerCode, ServerHello, negotiate,
};
use ch_native::{
    Client, Compression, DecodeError, Error, NamedColumn, Options, Query, Results, Setting, State,
    cancel_pair,
};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};

struct MockServer {
    r: Reader<'static>,
    w: WriteHalf<DuplexStream>,
    revision: u64,
    framing: Option<(Method, i32)>,
}

impl MockServer {
    async fn accept(io: DuplexStream, server_revision: u64) -> (Self, ClientHello) {
        let (rd, w) = tokio::io::split(io);
        let mut r = Reader::new(rd);
        assert_eq!(r.varint().await.unwrap(), ClientCode::Hello as u64);
        let hello = ClientHello::decode(&mut r).await.unwrap();
        let mut s = Self {
            r,
            w,
            revision: negotiate(hello.revision, server_revision),
            framing: None,
        };
        let mut b = Buffer::new();
        ServerHello {
            name: "ClickHouse".to_string(),
            major: 24,
            minor: 3,
            revision: server_revision,
            timezone: Some("UTC".to_string()),
            display_name: Some("mock".to_string()),
            patch: Some(1),
        }
        .encode(&mut b, hello.revision);
        s.send(b).await;
        if Feature::Addendum.supported(s.revision) {
            let _quota_key = s.r.str().await.unwrap();
        }
        (s, hello)
    }

    async fn send(&mut self, b: Buffer) {
        self.w.write_all(b.as_slice()).await.unwrap();
        self.w.flush().await.unwrap();
    }

    async fn send_code(&mut self, code: ServerCode) {
        let mut b = Buffer::new();
        code.encode(&mut b);
        self.send(b).await;
    }

    /// Query packet plus the empty external-tables block.
    async fn read_query(&mut self) -> QueryPacket {
        assert_eq!(self.r.varint().await.unwrap(), ClientCode::Query as u64);
        let q = QueryPacket::decode(&mut self.r, self.revision).await.unwrap();
        if q.compression {
            self.framing = Some((Method::Lz4, 0));
        }
        let (block, _) = self.read_data().await;
        assert!(block.is_end());
        q
    }

    async fn read_data(&mut self) -> (Block, Results) {
        assert_eq!(self.r.varint().await.unwrap(), ClientCode::Data as u64);
        assert_eq!(self.r.str().await.unwrap(), "");
        if self.framing.is_some() {
            self.r.enable_compression(true);
        }
        let mut res = Results::auto();
        let block = Block::decode(&mut self.r, self.revision, &DecodeLimits::default(), &mut res)
            .await
            .unwrap();
        self.r.disable_compression();
        (block, res)
    }

    async fn send_data(&mut self, code: ServerCode, cols: &mut [NamedColumn]) {
        let framing = if code.compressible() { self.framing } else { None };
        let mut b = Buffer::new();
        encode_data_packet(&mut b, code as u64, self.revision, framing, cols).unwrap();
        self.send(b).await;
    }

    async fn send_progress(&mut self, p: Progress) {
        let mut b = Buffer::new();
        ServerCode::Progress.encode(&mut b);
        p.encode(&mut b, self.revision);
        self.send(b).await;
    }

    async fn send_exception(&mut self, e: &Exception) {
        let mut b = Buffer::new();
        ServerCode::Exception.encode(&mut b);
        e.encode(&mut b);
        self.send(b).await;
    }

    /// Trailing empty block, then EndOfStream.
    async fn finish(&mut self) {
        self.send_data(ServerCode::Data, &mut []).await;
        self.send_code(ServerCode::EndOfStream).await;
    }
}

fn rows(numbers: &[u64], names: &[&str]) -> Vec<NamedColumn> {
    vec![
        NamedColumn::new("number", ColUInt64::from_values(numbers.iter().copied())),
        NamedColumn::new("name", ColStr::from_values(names.iter().copied())),
    ]
}

#[tokio::test]
async fn test_select_streams_blocks() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, hello) = MockServer::accept(server_io, CLIENT_REVISION).await;
        assert_eq!(hello.database, "default");
        assert_eq!(hello.revision, CLIENT_REVISION);

        let q = s.read_query().await;
        assert_eq!(q.body, "SELECT number, name FROM t");
        assert_eq!(q.settings, vec![Setting::new("max_threads", "2")]);
        assert!(!q.compression);
        assert_eq!(q.info.client_name, "ch-native");

        s.send_data(ServerCode::Data, &mut rows(&[], &[])).await;
        s.send_data(ServerCode::Data, &mut rows(&[1, 2], &["a", "b"])).await;
        s.send_progress(Progress {
            rows: 2,
            bytes: 16,
            ..Progress::default()
        })
        .await;
        s.send_data(ServerCode::Data, &mut rows(&[3], &["c"])).await;
        s.send_progress(Progress {
            rows: 1,
            bytes: 8,
            ..Progress::default()
        })
        .await;
        let mut b = Buffer::new();
        ServerCode::ProfileInfo.encode(&mut b);
        ProfileInfo {
            rows: 3,
            blocks: 2,
            ..ProfileInfo::default()
        }
        .encode(&mut b);
        s.send(b).await;
        s.finish().await;

        assert_eq!(s.r.varint().await.unwrap(), ClientCode::Ping as u64);
        s.send_code(ServerCode::Pong).await;
    });

    let mut client = Client::with_stream(client_io, Options::new()).await.unwrap();
    assert_eq!(client.state(), State::Idle);
    assert_eq!(client.revision(), CLIENT_REVISION);
    assert_eq!(client.server().timezone.as_deref(), Some("UTC"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut q = Query::new("SELECT number, name FROM t")
        .setting(Setting::new("max_threads", "2"))
        .on_result(move |res| {
            let numbers = res.get::<ColUInt64>("number").unwrap();
            sink.lock().unwrap().extend_from_slice(numbers.values());
            Ok(())
        });
    let stats = client.query(&mut q).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(stats.rows, 3);
    assert_eq!(stats.blocks, 3);
    assert_eq!(stats.progress.rows, 3);
    assert_eq!(stats.profile.map(|p| p.rows), Some(3));
    // Targets hold the last block only.
    assert_eq!(q.results().get::<ColStr>("name").unwrap().get_str(0), Some("c"));
    assert_eq!(client.state(), State::Idle);

    client.ping().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_old_server_revision_omits_gated_fields() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, hello) = MockServer::accept(server_io, 5).await;
        assert_eq!(hello.revision, 9);
        assert_eq!(s.revision, 5);

        // No ClientInfo, no settings, no secret, no parameters, no block info.
        let mut expect = Buffer::new();
        expect.put_varint(ClientCode::Query as u64);
        expect.put_string("");
        expect.put_string("");
        expect.put_varint(2);
        expect.put_varint(0);
        expect.put_string("SELECT 1");
        expect.put_varint(ClientCode::Data as u64);
        expect.put_string("");
        expect.put_varint(0);
        expect.put_varint(0);

        let mut got = vec![0u8; expect.len()];
        s.r.read_full(&mut got).await.unwrap();
        assert_eq!(got, expect.as_slice());

        s.finish().await;
    });

    let opts = Options::new().revision(9);
    let mut client = Client::with_stream(client_io, opts).await.unwrap();
    assert_eq!(client.revision(), 5);
    assert_eq!(client.server().timezone, None);
    let mut q = Query::new("SELECT 1").setting(Setting::new("max_threads", "2"));
    client.query(&mut q).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_exception_keeps_connection_usable() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        s.read_query().await;
        s.send_exception(&Exception {
            code: 60,
            name: "DB::Exception".to_string(),
            message: "Table default.missing does not exist".to_string(),
            stack: String::new(),
            nested: None,
        })
        .await;

        let q = s.read_query().await;
        assert_eq!(q.body, "SELECT 1 AS one");
        let mut one = vec![NamedColumn::new("one", ColUInt8::from_values([1]))];
        s.send_data(ServerCode::Data, &mut one).await;
        s.finish().await;
    });

    let mut client = Client::with_stream(client_io, Options::new()).await.unwrap();
    let err = client
        .query(&mut Query::new("SELECT * FROM missing"))
        .await
        .unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(err.exception().map(|e| e.code), Some(60));
    assert_eq!(client.state(), State::Idle);

    let mut q = Query::new("SELECT 1 AS one");
    client.query(&mut q).await.unwrap();
    assert_eq!(q.results().get::<ColUInt8>("one").unwrap().values(), &[1]);
    server.await.unwrap();
}

#[tokio::test]
async fn test_insert_streams_input_blocks() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        let q = s.read_query().await;
        assert_eq!(q.body, "INSERT INTO t VALUES");

        let mut received = Vec::new();
        loop {
            let (block, res) = s.read_data().await;
            if block.is_end() {
                break;
            }
            received.extend_from_slice(res.get::<ColUInt64>("number").unwrap().values());
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
        s.send_code(ServerCode::EndOfStream).await;
    });

    let mut client = Client::with_stream(client_io, Options::new()).await.unwrap();
    let mut batches = vec![vec![5u64], vec![3, 4]];
    let mut q = Query::new("INSERT INTO t VALUES")
        .input(rows(&[1, 2], &["a", "b"]))
        .on_input(move |cols| {
            let Some(batch) = batches.pop() else {
                return Ok(false);
            };
            for n in batch {
                cols[0].get_mut::<ColUInt64>().unwrap().append(n);
                cols[1].get_mut::<ColStr>().unwrap().append("x");
            }
            Ok(true)
        });
    let stats = client.query(&mut q).await.unwrap();
    assert_eq!(stats.input_blocks, 3);
    assert_eq!(stats.input_rows, 5);
    server.await.unwrap();
}

#[tokio::test]
async fn test_insert_without_rows_still_ends_input() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        for _ in 0..2 {
            s.read_query().await;
            let (block, _) = s.read_data().await;
            assert!(block.is_end());
            s.send_code(ServerCode::EndOfStream).await;
        }
    });

    let opts = Options::new().read_timeout(Duration::from_secs(5));
    let mut client = Client::with_stream(client_io, opts).await.unwrap();
    let stats = client
        .query(&mut Query::new("INSERT INTO t VALUES").input(rows(&[], &[])))
        .await
        .unwrap();
    assert_eq!(stats.input_blocks, 0);
    assert_eq!(client.state(), State::Idle);

    let mut q = Query::new("INSERT INTO t VALUES")
        .input(rows(&[], &[]))
        .on_input(|_| Ok(false));
    let stats = client.query(&mut q).await.unwrap();
    assert_eq!(stats.input_rows, 0);
    assert_eq!(client.state(), State::Idle);
    server.await.unwrap();
}

#[tokio::test]
async fn test_bad_input_is_rejected_before_sending() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        // The rejected query never reached the wire.
        assert_eq!(s.r.varint().await.unwrap(), ClientCode::Ping as u64);
        s.send_code(ServerCode::Pong).await;
    });

    let mut client = Client::with_stream(client_io, Options::new()).await.unwrap();
    let err = client
        .query(&mut Query::new("INSERT INTO t VALUES").input(rows(&[1, 2], &["a"])))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RowMismatch { expected: 2, rows: 1, .. }));
    assert_eq!(client.state(), State::Idle);
    client.ping().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_compressed_results_and_logs() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        let q = s.read_query().await;
        assert!(q.compression);

        let names: Vec<String> = (0..1000).map(|i| format!("row-{}", i % 7)).collect();
        let numbers: Vec<u64> = (0..1000).collect();
        let mut cols = vec![
            NamedColumn::new("number", ColUInt64::from_values(numbers)),
            NamedColumn::new("name", ColStr::from_values(names)),
        ];
        s.send_data(ServerCode::Data, &mut cols).await;

        let mut log = vec![
            NamedColumn::new(
                "event_time",
                ColFixed::<u32>::date_time(None).with_values([1]),
            ),
            NamedColumn::new("event_time_microseconds", ColUInt32::from_values([0])),
            NamedColumn::new("host_name", ColStr::from_values(["mock"])),
            NamedColumn::new("query_id", ColStr::from_values(["q"])),
            NamedColumn::new("thread_id", ColUInt64::from_values([1])),
            NamedColumn::new("priority", ColInt8::from_values([7])),
            NamedColumn::new("source", ColStr::from_values(["executeQuery"])),
            NamedColumn::new("text", ColStr::from_values(["Read 1000 rows"])),
        ];
        s.send_data(ServerCode::Log, &mut log).await;
        s.finish().await;
    });

    let opts = Options::new().compression(Compression::Lz4);
    let mut client = Client::with_stream(client_io, opts).await.unwrap();
    let logs = Arc::new(Mutex::new(Vec::new()));
    let sink = logs.clone();
    let mut q = Query::new("SELECT number, name FROM big")
        .setting(Setting::new("send_logs_level", "trace"))
        .on_logs(move |lines| {
            sink.lock()
                .unwrap()
                .extend(lines.iter().map(|l| l.text.clone()));
            Ok(())
        });
    let stats = client.query(&mut q).await.unwrap();
    assert_eq!(stats.rows, 1000);
    assert_eq!(stats.log_lines, 1);
    assert_eq!(*logs.lock().unwrap(), vec!["Read 1000 rows".to_string()]);
    let names = q.results().get::<ColStr>("name").unwrap();
    assert_eq!(names.get_str(999), Some("row-5"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_corrupt_frame_fails_and_closes() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        s.read_query().await;

        let mut b = Buffer::new();
        encode_data_packet(
            &mut b,
            ServerCode::Data as u64,
            s.revision,
            Some((Method::Lz4, 0)),
            &mut rows(&[1, 2, 3], &["a", "b", "c"]),
        )
        .unwrap();
        // code, empty table name, 16-byte checksum, method, compressed size,
        // then the raw size field.
        let raw_size_at = 2 + 16 + 1 + 4;
        b.buf[raw_size_at] ^= 0x01;
        s.send(b).await;
        s.finish().await;
    });

    let opts = Options::new().compression(Compression::Lz4);
    let mut client = Client::with_stream(client_io, opts).await.unwrap();
    let err = client.query(&mut Query::new("SELECT 1")).await.unwrap_err();
    assert!(err.is_decode());
    assert!(matches!(err, Error::Decode(DecodeError::Checksum { .. })), "{err}");
    assert!(client.is_closed());
    assert!(matches!(client.ping().await, Err(Error::Closed)));
    server.await.unwrap();
}

#[tokio::test]
async fn test_cancel_sends_cancel_and_closes() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        s.read_query().await;
        s.send_progress(Progress::default()).await;
        // Hold the query open; the client must give up on its own.
        assert_eq!(s.r.varint().await.unwrap(), ClientCode::Cancel as u64);
    });

    let mut client = Client::with_stream(client_io, Options::new()).await.unwrap();
    let (handle, signal) = cancel_pair();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });
    let err = client
        .query(&mut Query::new("SELECT sleep(100)").cancel(signal))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(client.is_closed());
    canceller.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_read_timeout_is_fatal() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let (mut s, _) = MockServer::accept(server_io, CLIENT_REVISION).await;
        s.read_query().await;
        // Drain until the client hangs up.
        let mut sink = [0u8; 1];
        while s.r.read_full(&mut sink).await.is_ok() {}
    });

    let opts = Options::new().read_timeout(Duration::from_millis(30));
    let mut client = Client::with_stream(client_io, opts).await.unwrap();
    let err = client.query(&mut Query::new("SELECT 1")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { operation: "read", .. }));
    assert!(err.is_transport());
    assert!(client.is_closed());
    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_exception() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(async move {
        let (rd, mut w) = tokio::io::split(server_io);
        let mut r = Reader::new(rd);
        assert_eq!(r.varint().await.unwrap(), ClientCode::Hello as u64);
        let hello = ClientHello::decode(&mut r).await.unwrap();
        assert_eq!(hello.user, "nobody");
        let mut b = Buffer::new();
        ServerCode::Exception.encode(&mut b);
        Exception {
            code: 516,
            name: "DB::Exception".to_string(),
            message: "nobody: Authentication failed".to_string(),
            ..Exception::default()
        }
        .encode(&mut b);
        w.write_all(b.as_slice()).await.unwrap();
    });

    let err = Client::with_stream(client_io, Options::new().user("nobody"))
        .await
        .unwrap_err();
    assert_eq!(err.exception().map(|e| e.code), Some(516));
    server.await.unwrap();
}
