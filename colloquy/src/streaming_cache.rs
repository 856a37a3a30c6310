use candle_core::Tensor;
use std::collections::HashMap;

/// Per-layer causal context for chunked codec decoding, the conv analogue of a KV cache.
///
/// Keys are layer ids (`upsample_0`, `stage_3.block1`, `head`), values are the
/// trailing `[batch, channels, time]` inputs each layer needs from the previous chunk.
#[derive(Clone, Debug)]
pub struct StreamingCache {
    cache: HashMap<String, Tensor>,
    device: candle_core::Device,
    frames_decoded: usize,
}

impl StreamingCache {
    pub fn new(device: candle_core::Device) -> Self {
        Self {
            cache: HashMap::new(),
            device,
            frames_decoded: 0,
        }
    }

    pub fn get(&self, layer_id: &str) -> Option<&Tensor> {
        self.cache.get(layer_id)
    }

    pub fn set(&mut self, layer_id: String, state: Tensor) {
        self.cache.insert(layer_id, state);
    }

    /// Latent frames pushed through the decoder so far
    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }

    pub(crate) fn advance(&mut self, frames: usize) {
        self.frames_decoded += frames;
    }

    /// Forget all context; the next chunk decodes as if it started a new stream
    pub fn clear(&mut self) {
        self.cache.clear();
        self.frames_decoded = 0;
    }

    pub fn device(&self) -> &candle_core::Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
