//! Host-mode command session.
//!
//! # Concurrency Model
//!
//! - **Decode**: the calling thread reads envelopes and bodies strictly in
//!   arrival order. Framing has no length prefix, so this cannot be parallel.
//! - **Dispatch**: `ping`, `info` and `search` run on a rayon pool against
//!   the engine, so a slow `search` does not hold back a later `ping`.
//!   `train` and `save` go to a single mutation lane thread and run one at a
//!   time in arrival order, so a `save` never overtakes an earlier `train`.
//! - **Write**: a worker encodes its whole response into one frame and sends
//!   it to a single writer thread that owns the output. Frames never interleave
//!   and go out in completion order; the echoed id is the only correlation.
//!
//! `exit` stops decoding, waits for in-flight commands, then writes its own
//! echo and flushes. End of stream and fatal decode errors drain the same way.
//! If the output fails, decoding stops at the next command and nothing more
//! is dispatched.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::{ProtocolError, WireReader};
use crate::engine::{ErrorCode, IndexEngine};
use crate::params::SessionConfig;
use crate::protocol::{Envelope, Request, RequestFrame, Response, ResponseBody, ERROR_FLAG};
use crate::types::Command;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol error after {bytes_read} bytes: {source}")]
    Protocol {
        #[source]
        source: ProtocolError,
        bytes_read: u64,
    },

    #[error("output error: {0}")]
    Output(#[from] io::Error),

    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// An `exit` command with this id closed the session.
    Exit(u32),
    /// The input ended cleanly on an envelope boundary.
    EndOfStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub commands: u64,
    pub bytes_read: u64,
    pub reason: CloseReason,
}

/// Closes the engine when the session ends, however it ends.
struct CloseOnDrop<'a, E: IndexEngine + ?Sized>(&'a E);

impl<E: IndexEngine + ?Sized> Drop for CloseOnDrop<'_, E> {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct Session<'e, E: IndexEngine + ?Sized> {
    engine: &'e E,
    pool: rayon::ThreadPool,
}

impl<'e, E: IndexEngine + ?Sized> Session<'e, E> {
    pub fn new(engine: &'e E, config: SessionConfig) -> Result<Self, SessionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("aspects-worker-{i}"))
            .build()?;
        Ok(Self { engine, pool })
    }

    /// Serves commands from `input` until `exit`, end of stream or a fatal
    /// decode error. Consumes the session; the engine is closed on return.
    pub fn run<R: Read, W: Write + Send>(self, input: R, output: W) -> Result<SessionSummary, SessionError> {
        let _close = CloseOnDrop(self.engine);
        let mut reader = WireReader::new(input);
        let mut commands = 0u64;

        let output_gone = AtomicBool::new(false);

        let result = thread::scope(|scope| -> Result<CloseReason, SessionError> {
            let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
            let writer = thread::Builder::new()
                .name("aspects-writer".into())
                .spawn_scoped(scope, || write_frames(output, rx, &output_gone))?;

            let (lane_tx, lane_rx) = crossbeam_channel::unbounded::<RequestFrame>();
            let engine = self.engine;
            let lane_out = tx.clone();
            let lane = thread::Builder::new()
                .name("aspects-mutator".into())
                .spawn_scoped(scope, move || {
                    for frame in lane_rx.iter() {
                        if lane_out.send(encode_frame(execute(engine, frame))).is_err() {
                            warn!("response writer is gone, dropping response");
                        }
                    }
                })?;

            let decoded = self.pool.in_place_scope(|jobs| {
                let lanes = Lanes {
                    jobs,
                    responses: tx,
                    mutations: lane_tx,
                    output_gone: &output_gone,
                };
                self.decode_loop(&mut reader, lanes, &mut commands)
            });

            // pool jobs are done and the lane sender is dropped; the lane
            // finishes its queue, then the writer sees every sender gone
            lane.join().map_err(|_| SessionError::Panicked("mutation lane"))?;
            let written = writer.join().map_err(|_| SessionError::Panicked("response writer"))?;
            match (decoded, written) {
                (Ok(reason), Ok(mut output)) => {
                    if let CloseReason::Exit(id) = reason {
                        output.write_all(&Envelope::new(Command::Exit, id).to_bytes())?;
                    }
                    output.flush()?;
                    Ok(reason)
                }
                (Ok(_), Err(e)) => Err(SessionError::Output(e)),
                (Err(source), written) => {
                    match written {
                        Ok(mut output) => {
                            if let Err(e) = output.flush() {
                                warn!(error = %e, "flush failed after protocol error");
                            }
                        }
                        Err(e) => warn!(error = %e, "output failed before protocol error"),
                    }
                    Err(SessionError::Protocol {
                        source,
                        bytes_read: reader.consumed(),
                    })
                }
            }
        });

        match &result {
            Ok(reason) => info!(commands, bytes = reader.consumed(), ?reason, "session closed"),
            Err(e) => error!(commands, bytes = reader.consumed(), error = %e, "session aborted"),
        }
        result.map(|reason| SessionSummary {
            commands,
            bytes_read: reader.consumed(),
            reason,
        })
    }

    fn decode_loop<'scope, R: Read>(
        &self,
        reader: &mut WireReader<R>,
        lanes: Lanes<'_, 'scope>,
        commands: &mut u64,
    ) -> Result<CloseReason, ProtocolError>
    where
        'e: 'scope,
    {
        loop {
            let Some(frame) = RequestFrame::decode(reader)? else {
                return Ok(CloseReason::EndOfStream);
            };
            if lanes.output_gone.load(Ordering::Acquire) {
                // the writer reports its own error once the session unwinds
                debug!(id = frame.id, "output closed, not dispatching");
                return Ok(CloseReason::EndOfStream);
            }
            *commands += 1;
            debug!(
                id = frame.id,
                cmd = frame.request.command().name(),
                bytes = reader.consumed(),
                "decoded command"
            );
            match frame.request {
                Request::Exit => return Ok(CloseReason::Exit(frame.id)),
                Request::Train(_) | Request::Save => {
                    if let Err(err) = lanes.mutations.send(frame) {
                        warn!(id = err.0.id, "mutation lane is gone, dropping command");
                    }
                }
                _ => {
                    let engine = self.engine;
                    let tx = lanes.responses.clone();
                    lanes.jobs.spawn(move |_| {
                        let bytes = encode_frame(execute(engine, frame));
                        if tx.send(bytes).is_err() {
                            warn!("response writer is gone, dropping response");
                        }
                    });
                }
            }
        }
    }
}

/// Where decoded commands go.
struct Lanes<'a, 'scope> {
    /// Concurrent jobs for read-only commands.
    jobs: &'a rayon::Scope<'scope>,
    responses: Sender<Vec<u8>>,
    /// Serial queue for `train` and `save`.
    mutations: Sender<RequestFrame>,
    output_gone: &'a AtomicBool,
}

/// Runs one command against the engine. Engine failures become error
/// responses for that id and never end the session.
pub fn execute<E: IndexEngine + ?Sized>(engine: &E, frame: RequestFrame) -> Response {
    let cmd = frame.request.command();
    let id = frame.id;
    let body = match frame.request {
        Request::Ping => Ok(ResponseBody::Ping { epoch: epoch_millis() }),
        Request::Info => Ok(ResponseBody::Info(engine.info())),
        Request::Search { k, queries } => engine.search(&queries, k).map(ResponseBody::Search),
        Request::Train(vectors) => engine.train(vectors).map(|_| ResponseBody::Done),
        Request::Save => engine.save().map(|_| ResponseBody::Done),
        Request::Exit => Ok(ResponseBody::Done),
    };
    match body {
        Ok(body) => Response::new(cmd, id, body),
        Err(err) => {
            warn!(id, cmd = cmd.name(), error = %err, "command failed");
            Response::error(cmd, id, &err)
        }
    }
}

fn encode_frame(response: Response) -> Vec<u8> {
    match response.to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(id = response.id, error = %err, "engine produced an unencodable response");
            fallback_error_frame(response.cmd, response.id)
        }
    }
}

/// IO error response with an empty message. Always encodable.
fn fallback_error_frame(cmd: Command, id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&(cmd as u32 | ERROR_FLAG).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(ErrorCode::IoError as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

fn write_frames<W: Write>(output: W, rx: Receiver<Vec<u8>>, output_gone: &AtomicBool) -> io::Result<W> {
    let written = copy_frames(output, &rx);
    if written.is_err() {
        output_gone.store(true, Ordering::Release);
    }
    written
}

fn copy_frames<W: Write>(mut output: W, rx: &Receiver<Vec<u8>>) -> io::Result<W> {
    for frame in rx.iter() {
        output.write_all(&frame)?;
        if rx.is_empty() {
            output.flush()?;
        }
    }
    Ok(output)
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
