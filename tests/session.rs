use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use aspects::{
    CloseReason, Command, DataType, DistanceType, EngineError, ErrorCode, IndexEngine, IndexInfo,
    Request, RequestFrame, Response, ResponseBody, Samples, SchemaStream, Session, SessionConfig,
    SessionError, VectorDB, VectorStream,
};
use parking_lot::Mutex;

/// Engine whose search blocks for a while and which records its lifecycle.
#[derive(Default)]
struct SlowEngine {
    trained: AtomicUsize,
    closed: AtomicBool,
}

impl IndexEngine for SlowEngine {
    fn info(&self) -> IndexInfo {
        IndexInfo {
            id_size: 1,
            num_dims: 1,
            data_type: DataType::Float,
            distance_type: DistanceType::Euclidean,
            schema: SchemaStream::default(),
        }
    }

    fn train(&self, vectors: VectorStream) -> Result<(), EngineError> {
        self.trained.fetch_add(vectors.len(), Ordering::SeqCst);
        Ok(())
    }

    fn search(&self, queries: &VectorStream, _k: u32) -> Result<Vec<VectorStream>, EngineError> {
        thread::sleep(Duration::from_millis(300));
        Ok(vec![VectorStream::new(1, 1, DataType::Float); queries.len()])
    }

    fn save(&self) -> Result<(), EngineError> {
        Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        )))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Engine whose train is slow and which logs the order of mutations.
#[derive(Default)]
struct JournalEngine {
    journal: Mutex<Vec<&'static str>>,
}

impl IndexEngine for JournalEngine {
    fn info(&self) -> IndexInfo {
        SlowEngine::default().info()
    }

    fn train(&self, _vectors: VectorStream) -> Result<(), EngineError> {
        thread::sleep(Duration::from_millis(200));
        self.journal.lock().push("train");
        Ok(())
    }

    fn search(&self, queries: &VectorStream, _k: u32) -> Result<Vec<VectorStream>, EngineError> {
        Ok(vec![VectorStream::new(1, 1, DataType::Float); queries.len()])
    }

    fn save(&self) -> Result<(), EngineError> {
        self.journal.lock().push("save");
        Ok(())
    }
}

/// Serves its bytes up to `stall_at`, then waits before serving the rest.
struct StallingReader {
    data: Vec<u8>,
    pos: usize,
    stall_at: usize,
    stalled: bool,
}

impl Read for StallingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.stall_at && !self.stalled {
            thread::sleep(Duration::from_millis(300));
            self.stalled = true;
        }
        let end = if self.pos < self.stall_at { self.stall_at } else { self.data.len() };
        let n = buf.len().min(end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct BrokenPipe;

impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn encode(frames: &[RequestFrame]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for frame in frames {
        frame.encode(&mut bytes)?;
    }
    Ok(bytes)
}

fn one_query() -> Result<VectorStream> {
    let mut queries = VectorStream::new(1, 1, DataType::Float);
    queries.push(vec![0], Samples::Float(vec![0.0]))?;
    Ok(queries)
}

#[test]
fn every_id_is_echoed_exactly_once() -> Result<()> {
    let engine = SlowEngine::default();
    let input = encode(&[
        RequestFrame::new(7, Request::Ping),
        RequestFrame::new(3, Request::Info),
        RequestFrame::new(9, Request::Ping),
    ])?;
    let mut output = Vec::new();
    let summary = Session::new(&engine, SessionConfig::with_workers(3))?.run(&input[..], &mut output)?;
    assert_eq!(summary.commands, 3);
    assert_eq!(summary.reason, CloseReason::EndOfStream);
    assert_eq!(summary.bytes_read, input.len() as u64);

    let responses = Response::decode_all(&output)?;
    let ids: Vec<u32> = responses.iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids.iter().copied().collect::<HashSet<_>>(), HashSet::from([7, 3, 9]));
    for response in &responses {
        let expected = if response.id == 3 { Command::Info } else { Command::Ping };
        assert_eq!(response.cmd, expected);
    }
    assert!(engine.closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn slow_search_does_not_hold_back_ping() -> Result<()> {
    let engine = SlowEngine::default();
    let input = encode(&[
        RequestFrame::new(1, Request::Search { k: 1, queries: one_query()? }),
        RequestFrame::new(2, Request::Ping),
    ])?;
    let mut output = Vec::new();
    Session::new(&engine, SessionConfig::with_workers(2))?.run(&input[..], &mut output)?;

    let responses = Response::decode_all(&output)?;
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].id, 2);
    assert!(matches!(responses[0].body, ResponseBody::Ping { epoch } if epoch > 0));
    assert_eq!(responses[1].id, 1);
    assert!(matches!(&responses[1].body, ResponseBody::Search(streams) if streams.len() == 1));
    Ok(())
}

#[test]
fn exit_drains_in_flight_work_first() -> Result<()> {
    let engine = SlowEngine::default();
    let mut input = encode(&[
        RequestFrame::new(10, Request::Search { k: 1, queries: one_query()? }),
        RequestFrame::new(11, Request::Exit),
    ])?;
    // nothing after exit is read
    input.extend(encode(&[RequestFrame::new(12, Request::Ping)])?);

    let mut output = Vec::new();
    let summary = Session::new(&engine, SessionConfig::with_workers(2))?.run(&input[..], &mut output)?;
    assert_eq!(summary.reason, CloseReason::Exit(11));

    let responses = Response::decode_all(&output)?;
    let ids: Vec<u32> = responses.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![10, 11]);
    assert_eq!(responses[1].cmd, Command::Exit);
    assert_eq!(responses[1].body, ResponseBody::Done);
    Ok(())
}

#[test]
fn engine_errors_are_scoped_to_their_command() -> Result<()> {
    let engine = SlowEngine::default();
    let mut vectors = VectorStream::new(1, 1, DataType::Float);
    vectors.push(vec![4], Samples::Float(vec![1.0]))?;
    let input = encode(&[
        RequestFrame::new(1, Request::Save),
        RequestFrame::new(2, Request::Train(vectors)),
        RequestFrame::new(3, Request::Exit),
    ])?;
    let mut output = Vec::new();
    Session::new(&engine, SessionConfig::with_workers(1))?.run(&input[..], &mut output)?;

    let responses = Response::decode_all(&output)?;
    let save = responses.iter().find(|r| r.id == 1).expect("save response");
    assert_eq!(save.cmd, Command::Save);
    assert!(matches!(&save.body, ResponseBody::Error { code: ErrorCode::IoError, .. }));
    let train = responses.iter().find(|r| r.id == 2).expect("train response");
    assert_eq!(train.body, ResponseBody::Done);
    assert_eq!(engine.trained.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn malformed_input_closes_the_session() -> Result<()> {
    let engine = SlowEngine::default();
    let mut input = encode(&[RequestFrame::new(1, Request::Ping)])?;
    input.extend_from_slice(&99u32.to_le_bytes());
    input.extend_from_slice(&2u32.to_le_bytes());

    let mut output = Vec::new();
    let err = Session::new(&engine, SessionConfig::with_workers(1))?
        .run(&input[..], &mut output)
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol { bytes_read: 16, .. }));
    // the ping decoded before the bad envelope is still answered
    let responses = Response::decode_all(&output)?;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, 1);
    assert!(engine.closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn truncated_body_is_fatal() -> Result<()> {
    let engine = SlowEngine::default();
    let mut input = encode(&[RequestFrame::new(5, Request::Train(one_query()?))])?;
    input.pop();
    let mut output = Vec::new();
    let err = Session::new(&engine, SessionConfig::with_workers(1))?
        .run(&input[..], &mut output)
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol {
            source: aspects::ProtocolError::TruncatedInput { .. },
            ..
        }
    ));
    assert!(output.is_empty());
    assert_eq!(engine.trained.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn info_on_fresh_index() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let info = IndexInfo {
        id_size: 8,
        num_dims: 128,
        data_type: DataType::Float,
        distance_type: DistanceType::Cosine,
        schema: SchemaStream::default(),
    };
    let db = VectorDB::<12, 24>::create(dir.path(), info.clone())?;
    let input = encode(&[RequestFrame::new(42, Request::Info)])?;
    let mut output = Vec::new();
    Session::new(&db, SessionConfig::default())?.run(&input[..], &mut output)?;

    // envelope + idSize + numDims + dataType + distanceType + schema count
    assert_eq!(output.len(), 8 + 4 + 4 + 1 + 1 + 4);
    assert_eq!(&output[18..22], &0u32.to_le_bytes());
    let responses = Response::decode_all(&output)?;
    assert_eq!(responses[0].body, ResponseBody::Info(info));
    Ok(())
}

#[test]
fn search_finds_the_stored_vector_at_distance_zero() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = VectorDB::<12, 24>::create(
        dir.path(),
        IndexInfo {
            id_size: 4,
            num_dims: 3,
            data_type: DataType::Float,
            distance_type: DistanceType::Euclidean,
            schema: SchemaStream::default(),
        },
    )?;
    let mut stored = VectorStream::new(4, 3, DataType::Float);
    stored.push(*b"only", Samples::Float(vec![0.25, -1.0, 3.5]))?;
    let mut query = VectorStream::new(4, 3, DataType::Float);
    query.push(*b"qury", Samples::Float(vec![0.25, -1.0, 3.5]))?;

    let input = encode(&[
        RequestFrame::new(1, Request::Train(stored)),
        RequestFrame::new(2, Request::Exit),
    ])?;
    let mut output = Vec::new();
    Session::new(&db, SessionConfig::default())?.run(&input[..], &mut output)?;

    let input = encode(&[RequestFrame::new(3, Request::Search { k: 3, queries: query })])?;
    let mut output = Vec::new();
    Session::new(&db, SessionConfig::default())?.run(&input[..], &mut output)?;

    let responses = Response::decode_all(&output)?;
    let ResponseBody::Search(streams) = &responses[0].body else {
        panic!("expected search body, got {:?}", responses[0].body);
    };
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].num_dims, 1);
    assert_eq!(streams[0].len(), 1);
    assert_eq!(streams[0].records[0].id, b"only".to_vec());
    assert_eq!(streams[0].records[0].dims, Samples::Float(vec![0.0]));
    Ok(())
}

#[test]
fn search_before_train_answers_not_trained() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = VectorDB::<12, 24>::create(
        dir.path(),
        IndexInfo {
            id_size: 1,
            num_dims: 1,
            data_type: DataType::Float,
            distance_type: DistanceType::Euclidean,
            schema: SchemaStream::default(),
        },
    )?;
    let input = encode(&[
        RequestFrame::new(1, Request::Search { k: 1, queries: one_query()? }),
        RequestFrame::new(2, Request::Ping),
    ])?;
    let mut output = Vec::new();
    let summary = Session::new(&db, SessionConfig::default())?.run(&input[..], &mut output)?;
    assert_eq!(summary.commands, 2);

    let responses = Response::decode_all(&output)?;
    let search = responses.iter().find(|r| r.id == 1).expect("search response");
    assert!(search.is_error());
    assert!(matches!(
        &search.body,
        ResponseBody::Error { code: ErrorCode::NotTrained, .. }
    ));
    assert!(responses.iter().any(|r| r.id == 2 && r.cmd == Command::Ping));
    Ok(())
}

#[test]
fn save_never_overtakes_an_earlier_train() -> Result<()> {
    let engine = JournalEngine::default();
    let input = encode(&[
        RequestFrame::new(1, Request::Train(one_query()?)),
        RequestFrame::new(2, Request::Save),
        RequestFrame::new(3, Request::Exit),
    ])?;
    let mut output = Vec::new();
    Session::new(&engine, SessionConfig::with_workers(4))?.run(&input[..], &mut output)?;

    assert_eq!(*engine.journal.lock(), vec!["train", "save"]);
    let ids: Vec<u32> = Response::decode_all(&output)?.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn pipelined_train_save_exit_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let info = IndexInfo {
        id_size: 2,
        num_dims: 2,
        data_type: DataType::Float,
        distance_type: DistanceType::Euclidean,
        schema: SchemaStream::default(),
    };
    {
        let db = VectorDB::<12, 24>::create(dir.path(), info)?;
        let mut frames = Vec::new();
        for round in 0..8u16 {
            let mut vectors = VectorStream::new(2, 2, DataType::Float);
            for i in 0..50u16 {
                let id = round * 50 + i;
                vectors.push(id.to_le_bytes(), Samples::Float(vec![f32::from(id), 1.0]))?;
            }
            frames.push(RequestFrame::new(u32::from(round) * 3, Request::Train(vectors)));
            frames.push(RequestFrame::new(
                u32::from(round) * 3 + 1,
                Request::Search { k: 1, queries: one_query_2d()? },
            ));
            frames.push(RequestFrame::new(u32::from(round) * 3 + 2, Request::Save));
        }
        frames.push(RequestFrame::new(1000, Request::Exit));
        let input = encode(&frames)?;
        let mut output = Vec::new();
        Session::new(&db, SessionConfig::with_workers(4))?.run(&input[..], &mut output)?;
        assert_eq!(db.pending(), 0);
    }
    let db = VectorDB::<12, 24>::open(dir.path())?;
    assert_eq!(db.len(), 400);
    Ok(())
}

fn one_query_2d() -> Result<VectorStream> {
    let mut queries = VectorStream::new(2, 2, DataType::Float);
    queries.push(vec![0, 0], Samples::Float(vec![0.0, 0.0]))?;
    Ok(queries)
}

#[test]
fn broken_output_stops_dispatch() -> Result<()> {
    let engine = SlowEngine::default();
    let ping = encode(&[RequestFrame::new(1, Request::Ping)])?;
    let mut data = ping.clone();
    data.extend(encode(&[RequestFrame::new(2, Request::Train(one_query()?))])?);
    let input = StallingReader {
        data,
        pos: 0,
        stall_at: ping.len(),
        stalled: false,
    };

    let err = Session::new(&engine, SessionConfig::with_workers(2))?
        .run(input, BrokenPipe)
        .unwrap_err();
    assert!(matches!(err, SessionError::Output(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    assert_eq!(engine.trained.load(Ordering::SeqCst), 0);
    assert!(engine.closed.load(Ordering::SeqCst));
    Ok(())
}
