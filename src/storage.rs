use crate::engine::{EngineError, IndexInfo};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"ASP0";
pub const VERSION: u8 = 1;
pub const INDEX_FILE: &str = "index.vdb";

#[derive(Serialize, Deserialize)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u8,
    pub info: IndexInfo,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: Vec<u8>,
    pub vector: Vec<f64>,
}

/// Index file inside an index directory: a header followed by appended entries.
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn index_path<P: AsRef<Path>>(dir: P) -> PathBuf {
        dir.as_ref().join(INDEX_FILE)
    }

    pub fn create<P: AsRef<Path>>(dir: P, info: &IndexInfo) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(EngineError::NotFound(dir.to_path_buf()));
        }
        let path = Self::index_path(dir);
        let header = Header {
            magic: MAGIC,
            version: VERSION,
            info: info.clone(),
        };
        // never overwrite an existing index
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &header)?;
        writer.flush()?;
        Ok(Self { path })
    }

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<(Self, Header, Vec<StoredEntry>), EngineError> {
        let path = Self::index_path(dir);
        if !path.is_file() {
            return Err(EngineError::NotFound(path));
        }
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let header: Header = bincode::deserialize_from(&mut reader)
            .map_err(|e| EngineError::SchemaMismatch(format!("unreadable header: {e}")))?;
        if header.magic != MAGIC {
            return Err(EngineError::SchemaMismatch("invalid magic".into()));
        }
        if header.version != VERSION {
            return Err(EngineError::SchemaMismatch(format!(
                "unsupported version {}",
                header.version
            )));
        }
        let mut entries = Vec::new();
        loop {
            match bincode::deserialize_from::<_, StoredEntry>(&mut reader) {
                Ok(e) => entries.push(e),
                Err(e) => {
                    if let bincode::ErrorKind::Io(ref io_err) = *e {
                        if io_err.kind() == std::io::ErrorKind::UnexpectedEof {
                            break;
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        Ok((Self { path }, header, entries))
    }

    pub fn append_entries(&self, entries: &[StoredEntry]) -> Result<(), EngineError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            bincode::serialize_into(&mut writer, entry)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
