//! Paged key/value cache with per-layer attention scheduling.
//!
//! Each layer holds a K and a V buffer shaped `heads x max_len x head_dim`.
//! Sliding-window layers treat the length axis as a ring of the window size;
//! full-attention layers append. There is a single writer (the generation
//! loop); clearing the context resets the logical length and leaves the
//! backing memory untouched.

use half::bf16;

use flm_npu::Buffer;

use crate::config::LmConfig;
use crate::error::EngineError;
use crate::Result;

struct LayerKv {
    k: Buffer<bf16>,
    v: Buffer<bf16>,
    sliding: bool,
}

pub struct KvCache {
    layers: Vec<LayerKv>,
    heads: usize,
    head_dim: usize,
    max_len: usize,
    window: usize,
    cur_len: usize,
}

impl KvCache {
    /// Host-backed cache sized from the model config.
    pub fn new_host(config: &LmConfig, max_len: usize) -> Result<Self> {
        let heads = config.num_key_value_heads as usize;
        let head_dim = config.head_dim as usize;
        let mut layers = Vec::with_capacity(config.num_hidden_layers as usize);
        for layer in 0..config.num_hidden_layers {
            layers.push(LayerKv {
                k: Buffer::host(heads * max_len * head_dim)?,
                v: Buffer::host(heads * max_len * head_dim)?,
                sliding: config.is_sliding(layer),
            });
        }
        Ok(Self {
            layers,
            heads,
            head_dim,
            max_len,
            window: config.sliding_window as usize,
            cur_len: 0,
        })
    }

    /// Cache over caller-allocated buffers (device-backed in production).
    /// Buffer `l` of `buffers` becomes layer `l`'s K/V pair.
    pub fn from_parts(
        config: &LmConfig,
        max_len: usize,
        buffers: Vec<(Buffer<bf16>, Buffer<bf16>)>,
    ) -> Result<Self> {
        let heads = config.num_key_value_heads as usize;
        let head_dim = config.head_dim as usize;
        if buffers.len() != config.num_hidden_layers as usize {
            return Err(EngineError::InvalidRequest(format!(
                "kv cache needs {} layer buffers, got {}",
                config.num_hidden_layers,
                buffers.len()
            )));
        }
        let layers = buffers
            .into_iter()
            .enumerate()
            .map(|(l, (k, v))| LayerKv {
                k,
                v,
                sliding: config.is_sliding(l as u32),
            })
            .collect();
        Ok(Self {
            layers,
            heads,
            head_dim,
            max_len,
            window: config.sliding_window as usize,
            cur_len: 0,
        })
    }

    pub fn cur_len(&self) -> usize {
        self.cur_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_sliding(&self, layer: usize) -> bool {
        self.layers[layer].sliding
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether `n` more positions fit the compiled window.
    pub fn can_insert(&self, n: usize) -> bool {
        self.cur_len + n <= self.max_len
    }

    /// The physical slot position `t` writes into on `layer`.
    pub fn write_slot(&self, layer: usize, t: usize) -> usize {
        if self.layers[layer].sliding {
            t % self.window
        } else {
            t
        }
    }

    /// Store K/V rows for position `t`. Slices are head-major
    /// (`heads x head_dim` values).
    pub fn append(&mut self, layer: usize, t: usize, k: &[bf16], v: &[bf16]) -> Result<()> {
        if t >= self.max_len {
            return Err(EngineError::MaxContextReached);
        }
        let expected = self.heads * self.head_dim;
        if k.len() != expected || v.len() != expected {
            return Err(EngineError::InvalidRequest(format!(
                "kv row must hold {expected} values, got {} / {}",
                k.len(),
                v.len()
            )));
        }
        let slot = self.write_slot(layer, t);
        let entry = &mut self.layers[layer];
        for h in 0..self.heads {
            let dst = (h * self.max_len + slot) * self.head_dim;
            let src = h * self.head_dim;
            entry.k.as_mut_slice()[dst..dst + self.head_dim]
                .copy_from_slice(&k[src..src + self.head_dim]);
            entry.v.as_mut_slice()[dst..dst + self.head_dim]
                .copy_from_slice(&v[src..src + self.head_dim]);
        }
        Ok(())
    }

    /// Advance the logical length after a position has been written to every
    /// layer.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if self.cur_len + n > self.max_len {
            return Err(EngineError::MaxContextReached);
        }
        self.cur_len += n;
        Ok(())
    }

    /// Physical slots attention reads at step `t`, in chronological order.
    /// Full layers read `[0..=t]`; sliding layers read the trailing window.
    pub fn read_window(&self, layer: usize, t: usize) -> Vec<usize> {
        if !self.layers[layer].sliding {
            return (0..=t).collect();
        }
        let live = (t + 1).min(self.window);
        let first = (t + 1 - live)..=t;
        first.map(|pos| pos % self.window).collect()
    }

    pub fn k(&self, layer: usize) -> &Buffer<bf16> {
        &self.layers[layer].k
    }

    pub fn v(&self, layer: usize) -> &Buffer<bf16> {
        &self.layers[layer].v
    }

    /// Reset the logical length; backing bytes stay as they are.
    pub fn clear(&mut self) {
        self.cur_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(layers: u32, window: u32, pattern: u32) -> LmConfig {
        serde_json::from_value(serde_json::json!({
            "model_type": "test",
            "vocab_size": 64,
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_attention_heads": 2,
            "num_hidden_layers": layers,
            "num_key_value_heads": 2,
            "head_dim": 4,
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0,
            "sliding_window": window,
            "sliding_window_pattern": pattern
        }))
        .unwrap()
    }

    #[test]
    fn test_sliding_read_window_is_trailing_positions() {
        let config = test_config(2, 4, 1); // every layer slides, W = 4
        let cache = KvCache::new_host(&config, 16).unwrap();
        assert!(cache.is_sliding(0));
        // Before the ring wraps: everything so far, in order.
        assert_eq!(cache.read_window(0, 2), vec![0, 1, 2]);
        // After wrapping, step t reads positions [t-W+1 ..= t] mod W.
        assert_eq!(cache.read_window(0, 5), vec![2, 3, 0, 1]);
        assert_eq!(cache.read_window(0, 9), vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_full_layer_reads_prefix() {
        let config = test_config(2, 4, 2); // layer 1 is full attention
        let cache = KvCache::new_host(&config, 16).unwrap();
        assert!(!cache.is_sliding(1));
        assert_eq!(cache.read_window(1, 5), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_write_slot_wraps_only_on_sliding_layers() {
        let config = test_config(2, 4, 2);
        let cache = KvCache::new_host(&config, 16).unwrap();
        assert_eq!(cache.write_slot(0, 6), 2); // sliding: 6 mod 4
        assert_eq!(cache.write_slot(1, 6), 6); // full: append
    }

    #[test]
    fn test_append_and_capacity() {
        let config = test_config(1, 0, 0);
        let mut cache = KvCache::new_host(&config, 4).unwrap();
        let row = vec![bf16::from_f32(1.5); 2 * 4];
        for t in 0..4 {
            cache.append(0, t, &row, &row).unwrap();
            cache.advance(1).unwrap();
        }
        assert!(!cache.can_insert(1));
        assert!(matches!(
            cache.advance(1),
            Err(EngineError::MaxContextReached)
        ));
        assert!(matches!(
            cache.append(0, 4, &row, &row),
            Err(EngineError::MaxContextReached)
        ));
    }

    #[test]
    fn test_clear_keeps_bytes() {
        let config = test_config(1, 0, 0);
        let mut cache = KvCache::new_host(&config, 4).unwrap();
        let row = vec![bf16::from_f32(2.0); 8];
        cache.append(0, 0, &row, &row).unwrap();
        cache.advance(1).unwrap();
        cache.clear();
        assert_eq!(cache.cur_len(), 0);
        // clear_context o insert o clear_context == clear_context: the
        // logical state is empty, the bytes are whatever was written.
        assert_eq!(cache.k(0).as_slice()[0], bf16::from_f32(2.0));
        assert!(cache.can_insert(4));
    }
}
