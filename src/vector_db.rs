use hnsw::Searcher;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, IndexEngine, IndexInfo};
use crate::metrics::{from_sortable, Index};
use crate::params::Params;
use crate::storage::{Storage, StoredEntry};
use crate::vector_stream::{Samples, VectorRecord, VectorStream};

#[derive(Clone)]
struct Entry {
    id: Vec<u8>,
    deleted: bool,
}

struct State<const M: usize, const M0: usize> {
    index: Index<M, M0>,
    searcher: Searcher<u64>,
    entries: Vec<Entry>,
    /// Live id -> slot in `entries` and the graph.
    ids: HashMap<Vec<u8>, usize>,
    /// Trained but not yet saved.
    pending: Vec<StoredEntry>,
}

impl<const M: usize, const M0: usize> State<M, M0> {
    fn apply(&mut self, entry: StoredEntry) {
        // a re-trained id replaces the old vector
        if let Some(slot) = self.ids.remove(&entry.id) {
            self.entries[slot].deleted = true;
        }
        let slot = self.entries.len();
        self.index.insert(entry.vector, &mut self.searcher);
        self.entries.push(Entry {
            id: entry.id.clone(),
            deleted: false,
        });
        self.ids.insert(entry.id, slot);
    }
}

/// Disk-backed HNSW index implementing [`IndexEngine`].
pub struct VectorDB<const M: usize = 12, const M0: usize = 24> {
    storage: Storage,
    info: IndexInfo,
    params: Params,
    state: RwLock<State<M, M0>>,
}

impl<const M: usize, const M0: usize> VectorDB<M, M0> {
    /// Creates a new index in `dir`, which must already exist.
    pub fn create<P: AsRef<Path>>(dir: P, info: IndexInfo) -> Result<Self, EngineError> {
        Self::create_with_params(dir, info, Params::default())
    }

    pub fn create_with_params<P: AsRef<Path>>(
        dir: P,
        mut info: IndexInfo,
        params: Params,
    ) -> Result<Self, EngineError> {
        let schema_dims = info.schema.total_dims();
        if info.num_dims == 0 {
            info.num_dims = u32::try_from(schema_dims)
                .map_err(|_| EngineError::SchemaMismatch(format!("schema declares {schema_dims} dims")))?;
        } else if !info.schema.is_empty() && schema_dims != u64::from(info.num_dims) {
            return Err(EngineError::SchemaMismatch(format!(
                "schema declares {} dims, index has {}",
                schema_dims, info.num_dims
            )));
        }
        let storage = Storage::create(&dir, &info)?;
        info!(
            path = %storage.path().display(),
            id_size = info.id_size,
            num_dims = info.num_dims,
            aspects = info.schema.len(),
            "created index"
        );
        Ok(Self::new_empty(storage, info, params))
    }

    /// Opens the index stored in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, EngineError> {
        Self::open_with_params(dir, Params::default())
    }

    pub fn open_with_params<P: AsRef<Path>>(dir: P, params: Params) -> Result<Self, EngineError> {
        let (storage, header, stored_entries) = Storage::open(&dir)?;
        let db = Self::new_empty(storage, header.info, params);
        {
            let mut state = db.state.write();
            for entry in stored_entries {
                if entry.id.len() != db.info.id_size as usize
                    || entry.vector.len() != db.info.num_dims as usize
                {
                    return Err(EngineError::SchemaMismatch(format!(
                        "stored entry has a {}-byte id and {} dims",
                        entry.id.len(),
                        entry.vector.len()
                    )));
                }
                state.apply(entry);
            }
            info!(
                path = %db.storage.path().display(),
                vectors = state.ids.len(),
                "opened index"
            );
        }
        Ok(db)
    }

    fn new_empty(storage: Storage, info: IndexInfo, params: Params) -> Self {
        Self {
            storage,
            params,
            state: RwLock::new(State {
                index: Index::new_params(info.distance_type, params.ef_construction),
                searcher: Searcher::default(),
                entries: Vec::new(),
                ids: HashMap::new(),
                pending: Vec::new(),
            }),
            info,
        }
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.state.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vectors trained since the last save.
    pub fn pending(&self) -> usize {
        self.state.read().pending.len()
    }

    fn search_one(&self, state: &State<M, M0>, query: Vec<f64>, k: usize) -> VectorStream {
        let real_k = k.min(state.ids.len());
        let replaced = state.entries.len() - state.ids.len();
        let mut neighbors = vec![
            space::Neighbor {
                index: !0,
                distance: 0
            };
            state.entries.len()
        ];
        let mut searcher = Searcher::default();
        let ef = self.params.ef_search.max(real_k * 2).max(real_k + replaced);
        let found = state.index.nearest(&query, ef, &mut searcher, &mut neighbors);
        let mut results: Vec<(usize, f64)> = found
            .iter()
            .filter(|n| !state.entries[n.index].deleted)
            .map(|n| (n.index, from_sortable(n.distance)))
            .collect();
        results.sort_by_key(|(_, d)| OrderedFloat(*d));
        results.truncate(real_k);

        let mut stream = VectorStream::new(self.info.id_size, 1, self.info.data_type);
        stream.records = results
            .into_iter()
            .map(|(slot, d)| VectorRecord {
                id: state.entries[slot].id.clone(),
                dims: Samples::from_f64(self.info.data_type, &[d]),
            })
            .collect();
        stream
    }

    fn check_dims(&self, stream: &VectorStream) -> Result<(), EngineError> {
        if stream.num_dims != self.info.num_dims {
            return Err(EngineError::DimensionMismatch {
                field: "numDims",
                expected: self.info.num_dims,
                actual: stream.num_dims,
            });
        }
        Ok(())
    }
}

impl<const M: usize, const M0: usize> IndexEngine for VectorDB<M, M0> {
    fn info(&self) -> IndexInfo {
        self.info.clone()
    }

    fn train(&self, vectors: VectorStream) -> Result<(), EngineError> {
        if vectors.id_size != self.info.id_size {
            return Err(EngineError::DimensionMismatch {
                field: "idSize",
                expected: self.info.id_size,
                actual: vectors.id_size,
            });
        }
        self.check_dims(&vectors)?;

        let count = vectors.len();
        let mut state = self.state.write();
        for record in vectors.records {
            let entry = StoredEntry {
                id: record.id,
                vector: record.dims.to_f64(),
            };
            state.pending.push(entry.clone());
            state.apply(entry);
        }
        debug!(count, live = state.ids.len(), "trained vectors");
        Ok(())
    }

    fn search(&self, queries: &VectorStream, k: u32) -> Result<Vec<VectorStream>, EngineError> {
        self.check_dims(queries)?;
        let state = self.state.read();
        if state.ids.is_empty() {
            return Err(EngineError::NotTrained);
        }
        let state = &*state;
        let results = queries
            .records
            .par_iter()
            .map(|q| self.search_one(state, q.dims.to_f64(), k as usize))
            .collect();
        Ok(results)
    }

    fn save(&self) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if state.pending.is_empty() {
            return Ok(());
        }
        self.storage.append_entries(&state.pending)?;
        info!(count = state.pending.len(), "saved vectors");
        state.pending.clear();
        Ok(())
    }

    fn close(&self) {
        let pending = self.pending();
        if pending > 0 {
            warn!(pending, "closing index with unsaved vectors");
        }
    }
}
