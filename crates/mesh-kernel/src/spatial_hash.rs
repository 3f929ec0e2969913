//! Uniform-grid spatial hash mapping positions and boxes to item indices.
//!
//! Cells are hashed into a fixed, prime-sized bucket table. Each bucket heads
//! a singly linked list of entries stored in one growable pool. Buckets carry
//! the generation in which they were last written, so [`SpatialHash::reset`]
//! only bumps the generation and truncates the pool instead of clearing the
//! table.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::spatial_hash::SpatialHash;
//! use nalgebra::Point3;
//!
//! let mut hash = SpatialHash::new(1.0);
//! hash.add_point(&Point3::new(0.5, 0.5, 0.5), 7);
//!
//! let mut found = Vec::new();
//! hash.query_point(&Point3::new(0.9, 0.1, 0.2), &mut found, usize::MAX);
//! assert_eq!(found, vec![7]);
//! ```

use crate::Bounds;
use nalgebra::Point3;

/// Default bucket count.
pub const DEFAULT_TABLE_SIZE: usize = 170_111;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    generation: u32,
    first: i32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    cell: [i32; 3],
    item: u32,
    next: i32,
}

/// Spatial hash over a uniform grid with cell size `spacing`.
#[derive(Debug, Clone)]
pub struct SpatialHash {
    spacing: f64,
    inv_spacing: f64,
    generation: u32,
    buckets: Vec<Bucket>,
    entries: Vec<Entry>,
}

impl SpatialHash {
    /// Create a hash with the default table size.
    pub fn new(spacing: f64) -> Self {
        Self::with_table_size(spacing, DEFAULT_TABLE_SIZE)
    }

    /// Create a hash with a custom bucket count.
    pub fn with_table_size(spacing: f64, table_size: usize) -> Self {
        let mut hash = Self {
            spacing: 1.0,
            inv_spacing: 1.0,
            generation: 1,
            buckets: vec![
                Bucket {
                    generation: 0,
                    first: -1,
                };
                table_size.max(1)
            ],
            entries: Vec::new(),
        };
        hash.set_spacing(spacing);
        hash
    }

    /// Change the cell size. Drops all entries.
    pub fn set_spacing(&mut self, spacing: f64) {
        self.spacing = if spacing > 0.0 { spacing } else { 1.0 };
        self.inv_spacing = 1.0 / self.spacing;
        self.reset();
    }

    /// Current cell size.
    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    /// Drop all entries in O(1).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            // generation counter wrapped, old stamps could alias
            for bucket in &mut self.buckets {
                bucket.generation = 0;
                bucket.first = -1;
            }
            self.generation = 1;
        }
    }

    /// Number of stored entries (a box spanning several cells counts once per cell).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Integer cell coordinates of a position.
    #[inline]
    pub fn cell_of(&self, p: &Point3<f64>) -> [i32; 3] {
        [
            (p.x * self.inv_spacing).floor() as i32,
            (p.y * self.inv_spacing).floor() as i32,
            (p.z * self.inv_spacing).floor() as i32,
        ]
    }

    #[inline]
    fn bucket_of(&self, cell: [i32; 3]) -> usize {
        let h = (cell[0] as i64).wrapping_mul(92_837_111)
            ^ (cell[1] as i64).wrapping_mul(689_287_499)
            ^ (cell[2] as i64).wrapping_mul(283_923_481);
        (h.unsigned_abs() % self.buckets.len() as u64) as usize
    }

    fn add_to_cell(&mut self, cell: [i32; 3], item: u32) {
        let b = self.bucket_of(cell);
        let bucket = &mut self.buckets[b];
        if bucket.generation != self.generation {
            bucket.generation = self.generation;
            bucket.first = -1;
        }
        let next = bucket.first;
        bucket.first = self.entries.len() as i32;
        self.entries.push(Entry { cell, item, next });
    }

    /// Add an item at a single position.
    pub fn add_point(&mut self, p: &Point3<f64>, item: u32) {
        let cell = self.cell_of(p);
        self.add_to_cell(cell, item);
    }

    /// Add an item to every cell overlapped by `bounds`.
    pub fn add_bounds(&mut self, bounds: &Bounds, item: u32) {
        if bounds.is_empty() {
            return;
        }
        let lo = self.cell_of(&bounds.min);
        let hi = self.cell_of(&bounds.max);
        for x in lo[0]..=hi[0] {
            for y in lo[1]..=hi[1] {
                for z in lo[2]..=hi[2] {
                    self.add_to_cell([x, y, z], item);
                }
            }
        }
    }

    fn collect_cell(&self, cell: [i32; 3], out: &mut Vec<u32>, max_results: usize) -> bool {
        let bucket = &self.buckets[self.bucket_of(cell)];
        if bucket.generation != self.generation {
            return true;
        }
        let mut e = bucket.first;
        while e >= 0 {
            let entry = &self.entries[e as usize];
            if entry.cell == cell {
                if out.len() >= max_results {
                    return false;
                }
                out.push(entry.item);
            }
            e = entry.next;
        }
        true
    }

    /// Append the items registered in the cell of `p`.
    ///
    /// At most `max_results` items end up in `out`; a miss leaves `out` untouched.
    pub fn query_point(&self, p: &Point3<f64>, out: &mut Vec<u32>, max_results: usize) {
        self.collect_cell(self.cell_of(p), out, max_results);
    }

    /// Append the items registered in any cell overlapped by `bounds`.
    ///
    /// Items spanning several cells may be reported more than once.
    pub fn query_bounds(&self, bounds: &Bounds, out: &mut Vec<u32>, max_results: usize) {
        if bounds.is_empty() {
            return;
        }
        let lo = self.cell_of(&bounds.min);
        let hi = self.cell_of(&bounds.max);
        for x in lo[0]..=hi[0] {
            for y in lo[1]..=hi[1] {
                for z in lo[2]..=hi[2] {
                    if !self.collect_cell([x, y, z], out, max_results) {
                        return;
                    }
                }
            }
        }
    }

    /// Like [`Self::query_point`], with `out` sorted and de-duplicated.
    pub fn query_unique_point(&self, p: &Point3<f64>, out: &mut Vec<u32>, max_results: usize) {
        self.query_point(p, out, max_results);
        out.sort_unstable();
        out.dedup();
    }

    /// Like [`Self::query_bounds`], with `out` sorted and de-duplicated.
    pub fn query_unique_bounds(&self, bounds: &Bounds, out: &mut Vec<u32>, max_results: usize) {
        self.query_bounds(bounds, out, max_results);
        out.sort_unstable();
        out.dedup();
    }
}
