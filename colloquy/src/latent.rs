//! Generated latent frames and the append-only arena that holds them.

use candle_core::{Device, Tensor};
use std::ops::Range;

use crate::{ColloquyError, Result};

/// One finalized acoustic latent covering a single codec hop.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentFrame {
    values: Vec<f32>,
}

impl LatentFrame {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Reads a `[dim]` or `[1, dim]` tensor.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self::new(t.flatten_all()?.to_vec1::<f32>()?))
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Every frame generated in a session, stored contiguously.
///
/// Frames are only ever appended, so indices handed out stay valid and
/// windows borrow straight from the arena.
#[derive(Debug, Clone)]
pub struct LatentSequence {
    data: Vec<f32>,
    dim: usize,
}

impl LatentSequence {
    pub fn new(dim: usize) -> Self {
        Self {
            data: Vec::new(),
            dim,
        }
    }

    pub fn with_capacity(dim: usize, frames: usize) -> Self {
        Self {
            data: Vec::with_capacity(dim * frames),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a frame, returning its index.
    pub fn push(&mut self, frame: &LatentFrame) -> Result<usize> {
        if frame.dim() != self.dim {
            return Err(ColloquyError::ConfigError(format!(
                "Latent frame has dim {}, sequence expects {}",
                frame.dim(),
                self.dim
            )));
        }
        self.data.extend_from_slice(frame.values());
        Ok(self.len() - 1)
    }

    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        (index < self.len()).then(|| &self.data[index * self.dim..(index + 1) * self.dim])
    }

    /// Frames `range` as one flat slice, `range.len() * dim` long.
    pub fn window(&self, range: Range<usize>) -> Option<&[f32]> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        Some(&self.data[range.start * self.dim..range.end * self.dim])
    }

    /// Element-wise mean over the frames in `range`.
    pub fn mean_pool(&self, range: Range<usize>) -> Option<Vec<f32>> {
        let count = range.len();
        let window = self.window(range)?;
        if count == 0 {
            return None;
        }
        let mut pooled = vec![0.0f32; self.dim];
        for frame in window.chunks_exact(self.dim) {
            for (acc, v) in pooled.iter_mut().zip(frame) {
                *acc += v;
            }
        }
        let inv = 1.0 / count as f32;
        pooled.iter_mut().for_each(|v| *v *= inv);
        Some(pooled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim.max(1))
    }

    /// `[1, dim, frames]` codec input for `range`
    pub fn to_tensor(&self, range: Range<usize>, device: &Device) -> Result<Tensor> {
        let frames = range.len();
        let window = self.window(range.clone()).ok_or_else(|| {
            ColloquyError::CodecDecodeFailure(format!(
                "Frame range {:?} outside sequence of {} frames",
                range,
                self.len()
            ))
        })?;
        let t = Tensor::from_slice(window, (1, frames, self.dim), device)?;
        Ok(t.transpose(1, 2)?.contiguous()?)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
