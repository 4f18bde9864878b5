//! Command envelopes and the request/response bodies they select.
//!
//! Nothing on the wire delimits a whole command. Each body decoder consumes
//! exactly the bytes its own fields declare, chosen by the envelope's `cmd`.
//!
//! | cmd    | request body          | response body                               |
//! |--------|-----------------------|---------------------------------------------|
//! | ping   | -                     | epoch:8                                     |
//! | info   | -                     | idSize:4 numDims:4 dataType:1 distanceType:1 SchemaStream |
//! | search | k:4 VectorStream      | count:8 VectorStream x count                |
//! | train  | VectorStream          | -                                           |
//! | save   | -                     | -                                           |
//! | exit   | -                     | -                                           |
//!
//! An engine failure is answered with `cmd | ERROR_FLAG` in the envelope and
//! a body of `code:4 len:4 message:len` (UTF-8).

use std::io::{Cursor, Read, Write};

use crate::codec::{ProtocolError, WireReader, WireWrite};
use crate::engine::{EngineError, ErrorCode, IndexInfo};
use crate::schema::SchemaStream;
use crate::types::{Command, DataType, DistanceType};
use crate::vector_stream::VectorStream;

pub const ENVELOPE_SIZE: usize = 8;

/// High bit of a response's `cmd` marking an error response.
pub const ERROR_FLAG: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Envelope {
    pub cmd: Command,
    pub id: u32,
}

impl Envelope {
    pub fn new(cmd: Command, id: u32) -> Self {
        Self { cmd, id }
    }

    pub fn from_bytes(bytes: [u8; ENVELOPE_SIZE]) -> Result<Self, ProtocolError> {
        let (cmd, id) = split_envelope(bytes);
        Ok(Self {
            cmd: Command::try_from(cmd)?,
            id,
        })
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut out = [0u8; ENVELOPE_SIZE];
        out[..4].copy_from_slice(&(self.cmd as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.id.to_le_bytes());
        out
    }

    pub fn decode<R: Read>(reader: &mut WireReader<R>) -> Result<Self, ProtocolError> {
        Self::from_bytes(reader.read_array()?)
    }

    /// Decodes an envelope, or `None` if the stream ended cleanly before it.
    pub fn try_decode<R: Read>(reader: &mut WireReader<R>) -> Result<Option<Self>, ProtocolError> {
        reader.try_read_array()?.map(Self::from_bytes).transpose()
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_all(&self.to_bytes())?;
        Ok(())
    }
}

fn split_envelope(bytes: [u8; ENVELOPE_SIZE]) -> (u32, u32) {
    let cmd = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    (cmd, id)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Ping,
    Info,
    Search { k: u32, queries: VectorStream },
    Train(VectorStream),
    Save,
    Exit,
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Ping => Command::Ping,
            Request::Info => Command::Info,
            Request::Search { .. } => Command::Search,
            Request::Train(_) => Command::Train,
            Request::Save => Command::Save,
            Request::Exit => Command::Exit,
        }
    }

    /// Decodes the body that follows an envelope carrying `cmd`.
    pub fn decode_body<R: Read>(cmd: Command, reader: &mut WireReader<R>) -> Result<Self, ProtocolError> {
        Ok(match cmd {
            Command::Ping => Request::Ping,
            Command::Info => Request::Info,
            Command::Search => {
                let k = reader.read_u32()?;
                let queries = VectorStream::decode(reader)?;
                Request::Search { k, queries }
            }
            Command::Train => Request::Train(VectorStream::decode(reader)?),
            Command::Save => Request::Save,
            Command::Exit => Request::Exit,
        })
    }

    pub fn encode_body<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        match self {
            Request::Search { k, queries } => {
                w.put_u32(*k)?;
                queries.encode(w)
            }
            Request::Train(vectors) => vectors.encode(w),
            Request::Ping | Request::Info | Request::Save | Request::Exit => Ok(()),
        }
    }
}

/// A request together with its correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestFrame {
    pub id: u32,
    pub request: Request,
}

impl RequestFrame {
    pub fn new(id: u32, request: Request) -> Self {
        Self { id, request }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.request.command(), self.id)
    }

    /// Decodes the next request, or `None` at a clean end of stream.
    pub fn decode<R: Read>(reader: &mut WireReader<R>) -> Result<Option<Self>, ProtocolError> {
        let Some(envelope) = Envelope::try_decode(reader)? else {
            return Ok(None);
        };
        let request = Request::decode_body(envelope.cmd, reader)?;
        Ok(Some(Self {
            id: envelope.id,
            request,
        }))
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        self.envelope().encode(w)?;
        self.request.encode_body(w)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Ping { epoch: u64 },
    Info(IndexInfo),
    Search(Vec<VectorStream>),
    /// Bare envelope echo, used by train, save and exit.
    Done,
    Error { code: ErrorCode, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub cmd: Command,
    pub id: u32,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(cmd: Command, id: u32, body: ResponseBody) -> Self {
        Self { cmd, id, body }
    }

    pub fn error(cmd: Command, id: u32, err: &EngineError) -> Self {
        Self::new(
            cmd,
            id,
            ResponseBody::Error {
                code: err.code(),
                message: err.to_string(),
            },
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error { .. })
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        let flag = if self.is_error() { ERROR_FLAG } else { 0 };
        w.put_u32(self.cmd as u32 | flag)?;
        w.put_u32(self.id)?;
        match &self.body {
            ResponseBody::Ping { epoch } => w.put_u64(*epoch)?,
            ResponseBody::Info(info) => encode_info(info, w)?,
            ResponseBody::Search(streams) => encode_neighbours(streams, w)?,
            ResponseBody::Done => {}
            ResponseBody::Error { code, message } => {
                let len = u32::try_from(message.len()).map_err(|_| {
                    ProtocolError::InconsistentRecord("error message exceeds u32".into())
                })?;
                w.put_u32(*code as u32)?;
                w.put_u32(len)?;
                w.write_all(message.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes the next response, or `None` at a clean end of stream.
    pub fn decode<R: Read>(reader: &mut WireReader<R>) -> Result<Option<Self>, ProtocolError> {
        let Some(bytes) = reader.try_read_array::<ENVELOPE_SIZE>()? else {
            return Ok(None);
        };
        let (raw, id) = split_envelope(bytes);
        let cmd = Command::try_from(raw & !ERROR_FLAG)?;

        let body = if raw & ERROR_FLAG != 0 {
            let code = ErrorCode::try_from(reader.read_u32()?)?;
            let len = reader.read_u32()? as usize;
            let message = String::from_utf8_lossy(&reader.read_bytes(len)?).into_owned();
            ResponseBody::Error { code, message }
        } else {
            match cmd {
                Command::Ping => ResponseBody::Ping {
                    epoch: reader.read_u64()?,
                },
                Command::Info => ResponseBody::Info(decode_info(reader)?),
                Command::Search => ResponseBody::Search(decode_neighbours(reader)?),
                Command::Train | Command::Save | Command::Exit => ResponseBody::Done,
            }
        };
        Ok(Some(Self { cmd, id, body }))
    }

    /// Decodes every response in `bytes`.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let mut reader = WireReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(response) = Self::decode(&mut reader)? {
            out.push(response);
        }
        Ok(out)
    }
}

pub fn encode_info<W: Write + ?Sized>(info: &IndexInfo, w: &mut W) -> Result<(), ProtocolError> {
    w.put_u32(info.id_size)?;
    w.put_u32(info.num_dims)?;
    w.put_u8(info.data_type as u8)?;
    w.put_u8(info.distance_type as u8)?;
    info.schema.encode(w)
}

pub fn decode_info<R: Read>(reader: &mut WireReader<R>) -> Result<IndexInfo, ProtocolError> {
    let id_size = reader.read_u32()?;
    let num_dims = reader.read_u32()?;
    let data_type = DataType::try_from(reader.read_u8()?)?;
    let distance_type = DistanceType::try_from(reader.read_u8()?)?;
    let schema = SchemaStream::decode(reader)?;
    Ok(IndexInfo {
        id_size,
        num_dims,
        data_type,
        distance_type,
        schema,
    })
}

/// Writes a search result body: `count:8` then one stream per query.
pub fn encode_neighbours<W: Write + ?Sized>(streams: &[VectorStream], w: &mut W) -> Result<(), ProtocolError> {
    w.put_u64(streams.len() as u64)?;
    streams.iter().try_for_each(|stream| stream.encode(w))
}

pub fn decode_neighbours<R: Read>(reader: &mut WireReader<R>) -> Result<Vec<VectorStream>, ProtocolError> {
    let count = reader.read_u64()?;
    let mut streams = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        streams.push(VectorStream::decode(reader)?);
    }
    Ok(streams)
}
