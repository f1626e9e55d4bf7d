//! Per-source aggregation and seeded linear dimensionality reduction.
//!
//! Each source is represented by the normalized mean of its unit vectors.
//! Those are projected onto their leading principal components, found by
//! power iteration from seeded starting vectors, so two runs with the same
//! seed and inputs produce identical coordinates.

use crate::vectorstore::IndexSnapshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const POWER_ITERATIONS: usize = 200;
const CONVERGENCE: f32 = 1e-7;

/// Mean unit vector per source, L2-normalized, keyed by source id.
pub fn source_vectors(snapshot: &IndexSnapshot) -> BTreeMap<String, Vec<f32>> {
    let mut sums: BTreeMap<String, (Vec<f32>, usize)> = BTreeMap::new();
    for entry in snapshot.entries() {
        let slot = sums
            .entry(entry.key.source_id.clone())
            .or_insert_with(|| (vec![0.0; entry.vector.len()], 0));
        for (acc, v) in slot.0.iter_mut().zip(&entry.vector) {
            *acc += v;
        }
        slot.1 += 1;
    }
    sums.into_iter()
        .map(|(id, (mut sum, n))| {
            for v in sum.iter_mut() {
                *v /= n as f32;
            }
            l2_normalize(&mut sum);
            (id, sum)
        })
        .collect()
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// A fitted linear projection: subtract `mean`, then dot with each component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub mean: Vec<f32>,
    pub components: Vec<Vec<f32>>,
}

impl Projection {
    pub fn fit(points: &[Vec<f32>], dims: usize, seed: u64) -> Self {
        let width = points.first().map(|p| p.len()).unwrap_or(0);
        let n = points.len();
        let mut mean = vec![0f32; width];
        for p in points {
            for (m, v) in mean.iter_mut().zip(p) {
                *m += v;
            }
        }
        if n > 0 {
            for m in mean.iter_mut() {
                *m /= n as f32;
            }
        }
        let centered: Vec<Vec<f32>> = points
            .iter()
            .map(|p| p.iter().zip(&mean).map(|(v, m)| v - m).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut components: Vec<Vec<f32>> = Vec::with_capacity(dims);
        for _ in 0..dims {
            let start: Vec<f32> = (0..width).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            components.push(leading_component(&centered, &components, start));
        }
        Self { mean, components }
    }

    pub fn project(&self, v: &[f32]) -> Vec<f32> {
        self.components
            .iter()
            .map(|c| {
                c.iter()
                    .zip(v.iter().zip(&self.mean))
                    .map(|(ci, (x, m))| ci * (x - m))
                    .sum()
            })
            .collect()
    }

    pub fn dims(&self) -> usize {
        self.components.len()
    }
}

/// Power iteration on the implicit covariance of `data`, orthogonal to
/// `previous`. Returns a zero vector when no variance is left.
fn leading_component(data: &[Vec<f32>], previous: &[Vec<f32>], start: Vec<f32>) -> Vec<f32> {
    let width = start.len();
    let mut v = start;
    orthogonalize(&mut v, previous);
    l2_normalize(&mut v);

    for _ in 0..POWER_ITERATIONS {
        let mut next = vec![0f32; width];
        for row in data {
            let proj: f32 = row.iter().zip(&v).map(|(a, b)| a * b).sum();
            for (n, r) in next.iter_mut().zip(row) {
                *n += proj * r;
            }
        }
        orthogonalize(&mut next, previous);
        let norm = next.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < 1e-9 {
            return vec![0.0; width];
        }
        for x in next.iter_mut() {
            *x /= norm;
        }
        let delta: f32 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
        v = next;
        if delta < CONVERGENCE {
            break;
        }
    }

    // Fix the sign so the largest coordinate is positive.
    let pivot = v
        .iter()
        .copied()
        .fold(0f32, |best, x| if x.abs() > best.abs() { x } else { best });
    if pivot < 0.0 {
        for x in v.iter_mut() {
            *x = -*x;
        }
    }
    v
}

fn orthogonalize(v: &mut [f32], basis: &[Vec<f32>]) {
    for b in basis {
        let dot: f32 = v.iter().zip(b).map(|(x, y)| x * y).sum();
        for (x, y) in v.iter_mut().zip(b) {
            *x -= dot * y;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reduction {
    /// Intermediate coordinates used for clustering.
    pub coordinates: BTreeMap<String, Vec<f32>>,
    /// Two-dimensional layout for display.
    pub layout: BTreeMap<String, [f32; 2]>,
    pub projection: Projection,
    pub layout_projection: Projection,
}

impl Reduction {
    pub fn fit(vectors: &BTreeMap<String, Vec<f32>>, dims: usize, seed: u64) -> Self {
        let points: Vec<Vec<f32>> = vectors.values().cloned().collect();
        let width = points.first().map(|p| p.len()).unwrap_or(0);
        let dims = dims.min(points.len()).min(width);
        let projection = Projection::fit(&points, dims, seed);
        let coordinates: BTreeMap<String, Vec<f32>> = vectors
            .iter()
            .map(|(id, v)| (id.clone(), projection.project(v)))
            .collect();

        let reduced: Vec<Vec<f32>> = coordinates.values().cloned().collect();
        let layout_projection = Projection::fit(&reduced, 2, seed.wrapping_add(1));
        let layout = coordinates
            .iter()
            .map(|(id, c)| {
                let p = layout_projection.project(c);
                (id.clone(), [p[0], p[1]])
            })
            .collect();

        Self {
            coordinates,
            layout,
            projection,
            layout_projection,
        }
    }

    /// Places a vector not seen during fitting into both coordinate spaces.
    pub fn place(&self, vector: &[f32]) -> (Vec<f32>, [f32; 2]) {
        let c = self.projection.project(vector);
        let p = self.layout_projection.project(&c);
        (c, [p[0], p[1]])
    }
}
