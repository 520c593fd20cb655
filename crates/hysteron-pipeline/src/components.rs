//! Connected-component labeling and seeded region growing.
//!
//! Connectivity is 6-neighborhood (face-adjacent voxels) throughout.

use std::collections::{HashMap, VecDeque};

use petgraph::unionfind::UnionFind;

use crate::segmentation::Segmentation;
use crate::types::{Mask, Volume};

/// Label the 6-connected components of `mask`.
///
/// Components are numbered `1..=n` in order of their first voxel in the
/// linear layout, so the result is deterministic.
#[must_use]
pub fn label_components(mask: &Mask) -> Segmentation {
    let shape = mask.shape();
    let fg = mask.as_slice();
    let mut uf = UnionFind::<usize>::new(fg.len());

    for i in (0..fg.len()).filter(|&i| fg[i]) {
        for n in shape.preceding_neighbors(i) {
            if fg[n] {
                uf.union(i, n);
            }
        }
    }

    let mut ids: HashMap<usize, u32> = HashMap::new();
    let mut next = 0_u32;
    let labels: Vec<u32> = (0..fg.len())
        .map(|i| {
            if !fg[i] {
                return 0;
            }
            let root = uf.find_mut(i);
            *ids.entry(root).or_insert_with(|| {
                next += 1;
                next
            })
        })
        .collect();
    Segmentation::new(Volume::from_index_fn(shape, |i| labels[i]))
}

/// Grow `seeds` through `mask` by breadth-first search.
///
/// Seed voxels outside `mask` are ignored. Every mask voxel reachable
/// from a seed takes the label of the seed that reaches it first;
/// ties resolve in linear order of the seeds. Unreachable mask voxels
/// stay background.
#[must_use]
pub fn grow_from_seeds(seeds: &Segmentation, mask: &Mask) -> Segmentation {
    let shape = mask.shape();
    let fg = mask.as_slice();
    let mut labels: Vec<u32> = seeds
        .labels()
        .as_slice()
        .iter()
        .zip(fg)
        .map(|(&s, &m)| if m { s } else { 0 })
        .collect();

    let mut queue: VecDeque<usize> = (0..labels.len()).filter(|&i| labels[i] != 0).collect();
    while let Some(i) = queue.pop_front() {
        let label = labels[i];
        for n in shape.neighbors(i) {
            if fg[n] && labels[n] == 0 {
                labels[n] = label;
                queue.push_back(n);
            }
        }
    }
    Segmentation::new(Volume::from_index_fn(shape, |i| labels[i]))
}
