//! Vector stream codec.
//!
//! ```text
//! idSize   4   u32
//! numDims  4   u32
//! dataType 1   DataType
//! count    8   u64
//! count x ( id: idSize bytes, dims: numDims x d bytes )
//! ```

use std::io::{self, Cursor, Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::{wire_len, ProtocolError, WireReader, WireWrite};
use crate::types::DataType;

/// Header size in bytes: 4 + 4 + 1 + 8 = 17
pub const HEADER_SIZE: usize = 17;

/// Most records a stream may declare when `idSize` and `numDims` are both zero.
pub const MAX_EMPTY_RECORDS: u64 = 1 << 16;

/// Samples of one vector, in the stream's data type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Samples {
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl Samples {
    pub fn data_type(&self) -> DataType {
        match self {
            Samples::Float(_) => DataType::Float,
            Samples::Double(_) => DataType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::Float(v) => v.len(),
            Samples::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Samples::Float(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Samples::Double(v) => v.clone(),
        }
    }

    pub fn from_f64(data_type: DataType, values: &[f64]) -> Self {
        match data_type {
            DataType::Float => Samples::Float(values.iter().map(|x| *x as f32).collect()),
            DataType::Double => Samples::Double(values.to_vec()),
        }
    }

    fn from_le_bytes(data_type: DataType, bytes: &[u8]) -> Self {
        match data_type {
            DataType::Float => Samples::Float(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Double => Samples::Double(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        }
    }

    fn write_le<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Samples::Float(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes())),
            Samples::Double(v) => v.iter().try_for_each(|x| w.write_all(&x.to_le_bytes())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Vec<u8>,
    pub dims: Samples,
}

/// A batch of vectors sharing one idSize, numDims and dataType.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorStream {
    pub id_size: u32,
    pub num_dims: u32,
    pub data_type: DataType,
    pub records: Vec<VectorRecord>,
}

impl VectorStream {
    pub fn new(id_size: u32, num_dims: u32, data_type: DataType) -> Self {
        Self {
            id_size,
            num_dims,
            data_type,
            records: Vec::new(),
        }
    }

    /// Appends a record after checking it against the stream header.
    pub fn push(&mut self, id: impl Into<Vec<u8>>, dims: Samples) -> Result<(), ProtocolError> {
        let record = VectorRecord {
            id: id.into(),
            dims,
        };
        self.check(&record)?;
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes taken by one record: `idSize + numDims * d`.
    pub fn record_size(&self) -> usize {
        self.id_size as usize + self.num_dims as usize * self.data_type.width()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.records.len() * self.record_size()
    }

    fn check(&self, record: &VectorRecord) -> Result<(), ProtocolError> {
        if record.id.len() != self.id_size as usize {
            return Err(ProtocolError::InconsistentRecord(format!(
                "id is {} bytes, stream idSize is {}",
                record.id.len(),
                self.id_size
            )));
        }
        if record.dims.len() != self.num_dims as usize {
            return Err(ProtocolError::InconsistentRecord(format!(
                "vector has {} dims, stream numDims is {}",
                record.dims.len(),
                self.num_dims
            )));
        }
        if record.dims.data_type() != self.data_type {
            return Err(ProtocolError::InconsistentRecord(format!(
                "vector is {:?}, stream dataType is {:?}",
                record.dims.data_type(),
                self.data_type
            )));
        }
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut WireReader<R>) -> Result<Self, ProtocolError> {
        let id_size = reader.read_u32()?;
        let num_dims = reader.read_u32()?;
        let data_type = DataType::try_from(reader.read_u8()?)?;
        let count = reader.read_u64()?;

        let id_len = id_size as usize;
        let dims_len = (num_dims as u64)
            .checked_mul(data_type.width() as u64)
            .and_then(|n| n.checked_add(id_size as u64))
            .ok_or_else(|| ProtocolError::InconsistentRecord("record size overflows".into()))?;
        let record_size = wire_len(dims_len, "record size")?;
        // zero-size records consume no input, so nothing else bounds count
        if record_size == 0 && count > MAX_EMPTY_RECORDS {
            return Err(ProtocolError::InconsistentRecord(format!(
                "{count} zero-size records exceeds the limit of {MAX_EMPTY_RECORDS}"
            )));
        }

        // count is untrusted; grow as records actually arrive
        let mut records = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let mut raw = reader.read_bytes(record_size)?;
            let dims = Samples::from_le_bytes(data_type, &raw[id_len..]);
            raw.truncate(id_len);
            records.push(VectorRecord { id: raw, dims });
        }

        Ok(Self {
            id_size,
            num_dims,
            data_type,
            records,
        })
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.put_u32(self.id_size)?;
        w.put_u32(self.num_dims)?;
        w.put_u8(self.data_type as u8)?;
        w.put_u64(self.records.len() as u64)?;
        for record in &self.records {
            self.check(record)?;
            w.write_all(&record.id)?;
            record.dims.write_le(w)?;
        }
        Ok(())
    }

    /// Decodes one stream from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut reader = WireReader::new(Cursor::new(bytes));
        let stream = Self::decode(&mut reader)?;
        Ok((stream, reader.consumed() as usize))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }
}
