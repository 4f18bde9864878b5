//! Vector index engine served over a compact binary protocol.
//!
//! Commands and their responses travel back to back over one duplex byte
//! stream. Each starts with an 8-byte `(cmd, id)` envelope; the rest of the
//! layout follows from the command tag and the sizes declared inside the body.

pub mod codec;
pub mod engine;
pub mod metrics;
pub mod params;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod storage;
pub mod types;
pub mod vector_db;
pub mod vector_stream;

pub use codec::{ProtocolError, WireReader};
pub use engine::{EngineError, ErrorCode, IndexEngine, IndexInfo};
pub use params::{Params, SessionConfig};
pub use protocol::{Envelope, Request, RequestFrame, Response, ResponseBody};
pub use schema::{Aspect, SchemaStream};
pub use session::{CloseReason, Session, SessionError, SessionSummary};
pub use types::{Command, DataType, DistanceType};
pub use vector_db::VectorDB;
pub use vector_stream::{Samples, VectorRecord, VectorStream};
