//! Signed distance field shapes.
//!
//! Mesh distance fields arrive as raw bytes in one of two source formats and
//! are decoded to `f32` samples, x fastest.

use glam::{UVec3, Vec3};
use plume_common::GridError;
use serde::{Deserialize, Serialize};

/// Source encoding of distance samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SdfFormat {
    /// Little-endian `f32` per sample
    F32,
    /// One byte per sample mapped to `byte / 255 * scale + bias`
    G8 {
        /// Distance range covered by 0..=255
        scale: f32,
        /// Distance at byte 0
        bias: f32,
    },
}

impl SdfFormat {
    /// G8 format covering `[min, max]`.
    #[must_use]
    pub fn g8_from_range(min: f32, max: f32) -> Self {
        Self::G8 {
            scale: max - min,
            bias: min,
        }
    }

    /// Bytes per sample.
    #[must_use]
    pub const fn sample_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::G8 { .. } => 1,
        }
    }
}

/// A decoded distance field.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSdf {
    dim: UVec3,
    data: Vec<f32>,
}

impl ShapeSdf {
    /// Decodes `bytes` holding `dim.x * dim.y * dim.z` samples.
    pub fn decode(dim: UVec3, format: SdfFormat, bytes: &[u8]) -> Result<Self, GridError> {
        let samples = (dim.x as usize) * (dim.y as usize) * (dim.z as usize);
        let expected = samples * format.sample_size();
        if bytes.len() != expected || samples == 0 {
            return Err(GridError::SdfSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let data = match format {
            SdfFormat::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(bytemuck::pod_read_unaligned::<[u8; 4]>(c)))
                .collect(),
            SdfFormat::G8 { scale, bias } => bytes.iter().map(|&b| f32::from(b) / 255.0 * scale + bias).collect(),
        };
        Ok(Self { dim, data })
    }

    /// Sample grid dimensions.
    #[must_use]
    pub const fn dim(&self) -> UVec3 {
        self.dim
    }

    /// Decoded samples, x fastest.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Nearest sample at a local coordinate in `[0, 1]^3`, clamped to the edges.
    #[must_use]
    pub fn sample(&self, uvw: Vec3) -> f32 {
        let max = (self.dim - UVec3::ONE).as_vec3();
        let p = (uvw.clamp(Vec3::ZERO, Vec3::ONE) * max).round().as_uvec3();
        let index = p.x + self.dim.x * (p.y + self.dim.y * p.z);
        self.data.get(index as usize).copied().unwrap_or(f32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_g8_maps_range() {
        let sdf = ShapeSdf::decode(UVec3::new(2, 1, 1), SdfFormat::g8_from_range(-1.0, 3.0), &[0, 255]).expect("decode");
        assert_eq!(sdf.data(), &[-1.0, 3.0]);
        assert_eq!(sdf.sample(Vec3::ZERO), -1.0);
        assert_eq!(sdf.sample(Vec3::splat(2.0)), 3.0);
    }

    #[test]
    fn test_decode_f32() {
        let values = [0.5_f32, -0.25];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let sdf = ShapeSdf::decode(UVec3::new(1, 2, 1), SdfFormat::F32, &bytes).expect("decode");
        assert_eq!(sdf.data(), &values);
    }

    #[test]
    fn test_size_mismatch() {
        let result = ShapeSdf::decode(UVec3::new(2, 2, 2), SdfFormat::F32, &[0; 8]);
        assert!(matches!(result, Err(GridError::SdfSizeMismatch { expected: 32, actual: 8 })));
    }
}
