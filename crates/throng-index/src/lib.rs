//! Spatial indexing abstractions for crowd neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A position handed to `rebuild` contained a NaN or infinite coordinate.
    #[error("non-finite position at index {0}")]
    NonFinitePosition(usize),
}

/// Common behaviour exposed by point indices over agent positions.
///
/// Queries take an arbitrary center point rather than a stored index so that
/// callers can probe wrapped images of a position in periodic worlds.
pub trait SpatialIndex {
    /// Rebuild internal structures from the current agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit every stored point within the squared radius of `center`,
    /// skipping `exclude` when provided. The visitor receives the point's
    /// index in the slice passed to `rebuild` and its squared distance to
    /// `center`.
    fn visit_within(
        &self,
        center: (f32, f32),
        radius_sq: f32,
        exclude: Option<usize>,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform bucket grid over the bounding box of the indexed points.
///
/// The cell size should match the dominant query radius; a range query then
/// touches at most a few cells per axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f32,
    #[serde(skip)]
    origin: (f32, f32),
    #[serde(skip)]
    cols: usize,
    #[serde(skip)]
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<u32>>,
    #[serde(skip)]
    points: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            origin: (0.0, 0.0),
            cols: 0,
            rows: 0,
            buckets: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Number of points currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the index currently holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn cell_coords(&self, x: f32, y: f32) -> (isize, isize) {
        let cx = ((x - self.origin.0) / self.cell_size).floor() as isize;
        let cy = ((y - self.origin.1) / self.cell_size).floor() as isize;
        (cx, cy)
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(5.0)
    }
}

impl SpatialIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.points.clear();
        self.points.extend_from_slice(positions);

        if positions.is_empty() {
            self.cols = 0;
            self.rows = 0;
            return Ok(());
        }

        let mut min = (f32::INFINITY, f32::INFINITY);
        let mut max = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            if !x.is_finite() || !y.is_finite() {
                return Err(IndexError::NonFinitePosition(idx));
            }
            min.0 = min.0.min(x);
            min.1 = min.1.min(y);
            max.0 = max.0.max(x);
            max.1 = max.1.max(y);
        }
        self.origin = min;
        self.cols = ((max.0 - min.0) / self.cell_size) as usize + 1;
        self.rows = ((max.1 - min.1) / self.cell_size) as usize + 1;

        let wanted = self.cols * self.rows;
        if self.buckets.len() < wanted {
            self.buckets.resize_with(wanted, Vec::new);
        }
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (cx, cy) = self.cell_coords(x, y);
            let bucket = cy as usize * self.cols + cx as usize;
            self.buckets[bucket].push(idx as u32);
        }
        Ok(())
    }

    fn visit_within(
        &self,
        center: (f32, f32),
        radius_sq: f32,
        exclude: Option<usize>,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if self.points.is_empty() || radius_sq < 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let (lo_x, lo_y) = self.cell_coords(center.0 - radius, center.1 - radius);
        let (hi_x, hi_y) = self.cell_coords(center.0 + radius, center.1 + radius);
        if hi_x < 0 || hi_y < 0 || lo_x >= self.cols as isize || lo_y >= self.rows as isize {
            return;
        }
        let lo_x = lo_x.max(0) as usize;
        let lo_y = lo_y.max(0) as usize;
        let hi_x = (hi_x as usize).min(self.cols - 1);
        let hi_y = (hi_y as usize).min(self.rows - 1);

        for cy in lo_y..=hi_y {
            for cx in lo_x..=hi_x {
                for &idx in &self.buckets[cy * self.cols + cx] {
                    let idx = idx as usize;
                    if exclude == Some(idx) {
                        continue;
                    }
                    let (px, py) = self.points[idx];
                    let dx = px - center.0;
                    let dy = py - center.1;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(idx, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}
