//! Schema stream codec.
//!
//! All fixed aspect headers come first, then the blobs in header order:
//!
//! ```text
//! count                      4   u32
//! count x ( type 4, numDims 4, blobSize 4 )
//! count x ( blob: blobSize bytes )
//! ```

use std::io::{Cursor, Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::{ProtocolError, WireReader, WireWrite};

pub const COUNT_SIZE: usize = 4;
pub const ASPECT_HEADER_SIZE: usize = 12;

/// One component of a schema. `kind` is opaque to the protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aspect {
    pub kind: u32,
    pub num_dims: u32,
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaStream {
    pub aspects: Vec<Aspect>,
}

struct AspectHeader {
    kind: u32,
    num_dims: u32,
    blob_size: u32,
}

impl SchemaStream {
    pub fn new(aspects: Vec<Aspect>) -> Self {
        Self { aspects }
    }

    pub fn len(&self) -> usize {
        self.aspects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aspects.is_empty()
    }

    /// Sum of the aspects' dimensions.
    pub fn total_dims(&self) -> u64 {
        self.aspects.iter().map(|a| u64::from(a.num_dims)).sum()
    }

    pub fn encoded_len(&self) -> usize {
        COUNT_SIZE
            + self.aspects.len() * ASPECT_HEADER_SIZE
            + self.aspects.iter().map(|a| a.blob.len()).sum::<usize>()
    }

    pub fn decode<R: Read>(reader: &mut WireReader<R>) -> Result<Self, ProtocolError> {
        let count = reader.read_u32()?;

        // blobs follow every header, so the headers are buffered first
        let mut headers = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            headers.push(AspectHeader {
                kind: reader.read_u32()?,
                num_dims: reader.read_u32()?,
                blob_size: reader.read_u32()?,
            });
        }

        let mut aspects = Vec::with_capacity(headers.len());
        for header in headers {
            let blob = reader.read_bytes(header.blob_size as usize)?;
            aspects.push(Aspect {
                kind: header.kind,
                num_dims: header.num_dims,
                blob,
            });
        }
        Ok(Self { aspects })
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        let count = u32::try_from(self.aspects.len()).map_err(|_| {
            ProtocolError::InconsistentRecord(format!("{} aspects exceed u32", self.aspects.len()))
        })?;
        w.put_u32(count)?;
        for aspect in &self.aspects {
            let blob_size = u32::try_from(aspect.blob.len()).map_err(|_| {
                ProtocolError::InconsistentRecord(format!("blob of {} bytes exceeds u32", aspect.blob.len()))
            })?;
            w.put_u32(aspect.kind)?;
            w.put_u32(aspect.num_dims)?;
            w.put_u32(blob_size)?;
        }
        for aspect in &self.aspects {
            w.write_all(&aspect.blob)?;
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut reader = WireReader::new(Cursor::new(bytes));
        let schema = Self::decode(&mut reader)?;
        Ok((schema, reader.consumed() as usize))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }
}
