use hnsw::{Hnsw, Searcher};
use rand_pcg::Pcg64;
use space::{Metric as SpaceMetric, Neighbor};

use crate::types::DistanceType;

const EPSILON: f64 = 1e-12;

/// Distance between two vectors; smaller means closer for every kind.
pub fn distance(kind: DistanceType, a: &[f64], b: &[f64]) -> f64 {
    match kind {
        DistanceType::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        DistanceType::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt(),
        DistanceType::DotProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>(),
        DistanceType::Cosine => {
            let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            let cos = if na < EPSILON || nb < EPSILON {
                0.0
            } else {
                dot / (na * nb)
            };
            1.0 - cos
        }
    }
}

/// Maps a distance onto a `u64` whose integer order matches the float order,
/// negative values included (dot product distances go below zero).
pub fn to_sortable(d: f64) -> u64 {
    let bits = d.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

pub fn from_sortable(key: u64) -> f64 {
    if key >> 63 == 1 {
        f64::from_bits(key & !(1 << 63))
    } else {
        f64::from_bits(!key)
    }
}

#[derive(Clone, Copy)]
pub struct Distance(pub DistanceType);

impl SpaceMetric<Vec<f64>> for Distance {
    type Unit = u64;
    fn distance(&self, a: &Vec<f64>, b: &Vec<f64>) -> Self::Unit {
        to_sortable(distance(self.0, a, b))
    }
}

/// HNSW graph over `f64` features.
pub struct Index<const M: usize, const M0: usize> {
    graph: Hnsw<Distance, Vec<f64>, Pcg64, M, M0>,
}

impl<const M: usize, const M0: usize> Index<M, M0> {
    pub fn new_params(kind: DistanceType, ef_construction: usize) -> Self {
        let params = hnsw::Params::new().ef_construction(ef_construction);
        Self {
            graph: Hnsw::new_params(Distance(kind), params),
        }
    }

    pub fn insert(&mut self, vector: Vec<f64>, searcher: &mut Searcher<u64>) -> usize {
        self.graph.insert(vector, searcher)
    }

    pub fn nearest<'a>(
        &self,
        query: &Vec<f64>,
        ef: usize,
        searcher: &mut Searcher<u64>,
        neighbors: &'a mut [Neighbor<u64>],
    ) -> &'a mut [Neighbor<u64>] {
        self.graph.nearest(query, ef, searcher, neighbors)
    }
}
