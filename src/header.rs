// src/header.rs

//! Grid geometry shared by every warp field of a model.
//!
//! Three coordinate systems are in play:
//! - physical: world units, `offset + normalized * spacing * resolution`
//! - normalized: `[0, 1]^3` over the whole grid (texture-coordinate convention,
//!   voxel `i` covers `[i / res, (i + 1) / res)`)
//! - row index: position in the flattened field, `3 * (x + rx * (y + ry * z)) + channel`

use crate::ThreadSafeStdError;
use serde::{Deserialize, Serialize};

/// Number of vector components per voxel of a warp field.
pub const CHANNELS: usize = 3;

/// Resolution, spacing and origin of the warp-field grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldHeader {
    /// Voxel counts `(rx, ry, rz)`.
    pub resolution: [usize; 3],
    /// Physical size of one voxel along each axis.
    pub spacing: [f64; 3],
    /// Physical position of the grid origin.
    pub offset: [f64; 3],
}

impl Default for FieldHeader {
    fn default() -> Self {
        Self {
            resolution: [1, 1, 1],
            spacing: [1.0, 1.0, 1.0],
            offset: [0.0, 0.0, 0.0],
        }
    }
}

impl FieldHeader {
    pub fn new(resolution: [usize; 3], spacing: [f64; 3], offset: [f64; 3]) -> Self {
        Self {
            resolution,
            spacing,
            offset,
        }
    }

    /// Grid of the given resolution with unit spacing at the origin.
    pub fn with_resolution(resolution: [usize; 3]) -> Self {
        Self {
            resolution,
            ..Self::default()
        }
    }

    pub fn num_voxels(&self) -> usize {
        self.resolution.iter().fold(1usize, |acc, &r| acc.saturating_mul(r))
    }

    /// Length of one flattened warp field, `3 * rx * ry * rz`. Saturates for
    /// grids that [`validate`](Self::validate) rejects.
    pub fn field_size(&self) -> usize {
        CHANNELS.saturating_mul(self.num_voxels())
    }

    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if self.resolution.iter().any(|&r| r == 0) {
            return Err(format!("Grid resolution {:?} has a zero axis.", self.resolution).into());
        }
        // One field's bytes must be addressable.
        let bytes = self
            .resolution
            .iter()
            .try_fold(CHANNELS * std::mem::size_of::<f32>(), |acc, &r| acc.checked_mul(r));
        if bytes.is_none() {
            return Err(format!("Grid resolution {:?} overflows the addressable field size.", self.resolution).into());
        }
        if self.spacing.iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(format!("Grid spacing {:?} must be finite and positive.", self.spacing).into());
        }
        if self.offset.iter().any(|o| !o.is_finite()) {
            return Err(format!("Grid offset {:?} must be finite.", self.offset).into());
        }
        Ok(())
    }

    pub fn physical_to_normalized(&self, p: [f64; 3]) -> [f64; 3] {
        let mut n = [0.0; 3];
        for k in 0..3 {
            let extent = self.spacing[k] * self.resolution[k] as f64;
            n[k] = if extent > 0.0 { (p[k] - self.offset[k]) / extent } else { 0.0 };
        }
        n
    }

    pub fn normalized_to_physical(&self, n: [f64; 3]) -> [f64; 3] {
        let mut p = [0.0; 3];
        for k in 0..3 {
            p[k] = self.offset[k] + n[k] * self.spacing[k] * self.resolution[k] as f64;
        }
        p
    }

    /// Voxel containing a normalized point. Points outside `[0, 1]` clamp to the border.
    pub fn normalized_to_voxel(&self, n: [f64; 3]) -> [usize; 3] {
        let mut v = [0usize; 3];
        for k in 0..3 {
            let res = self.resolution[k];
            if res == 0 {
                continue;
            }
            let scaled = (n[k] * res as f64).floor();
            v[k] = if scaled.is_nan() || scaled <= 0.0 {
                0
            } else {
                (scaled as usize).min(res - 1)
            };
        }
        v
    }

    /// Normalized coordinate of a voxel center.
    pub fn voxel_to_normalized(&self, v: [usize; 3]) -> [f64; 3] {
        let mut n = [0.0; 3];
        for k in 0..3 {
            n[k] = (v[k] as f64 + 0.5) / self.resolution[k].max(1) as f64;
        }
        n
    }

    pub fn voxel_linear_index(&self, v: [usize; 3]) -> usize {
        v[0] + self.resolution[0] * (v[1] + self.resolution[1] * v[2])
    }

    /// The x/y/z channel rows of the voxel containing normalized point `n`.
    pub fn row_indices(&self, n: [f64; 3]) -> [usize; 3] {
        let base = CHANNELS * self.voxel_linear_index(self.normalized_to_voxel(n));
        [base, base + 1, base + 2]
    }

    /// Pushes the three channel rows of normalized point `n` onto `rows`.
    pub fn append_row_indices(&self, n: [f64; 3], rows: &mut Vec<usize>) {
        rows.extend_from_slice(&self.row_indices(n));
    }
}
