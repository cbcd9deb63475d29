//! KV cache for incremental decoding.
//!
//! Each layer owns a key and a value buffer shaped
//! `[batch, num_kv_heads, capacity, head_dim]`. A single `position` cursor
//! counts the tokens committed across all layers: it only moves once the last
//! layer of a forward pass has inserted its slice, so every layer writes the
//! same positions during one pass.
//!
//! Buffers are written in place. When an insert would overflow, every layer
//! is reallocated to a larger capacity (rounded up to a multiple of
//! [`GROWTH_STEP`], plus one extra step of headroom) and the committed
//! content is copied over.

use crate::error::{NanochatError, Result};
use crate::model::ModelConfig;
use candle_core::{DType, Device, Tensor};

/// Capacity granularity used when the cache has to grow.
pub const GROWTH_STEP: usize = 1024;

/// Geometry of a [`KvCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheConfig {
    /// Number of sequences decoded together.
    pub batch_size: usize,
    /// Number of key/value heads.
    pub num_kv_heads: usize,
    /// Initial capacity in positions.
    pub seq_len: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Number of transformer layers.
    pub num_layers: usize,
}

impl KvCacheConfig {
    /// Geometry matching `config` for `seq_len` expected positions.
    pub fn for_model(config: &ModelConfig, batch_size: usize, seq_len: usize) -> Self {
        Self {
            batch_size,
            num_kv_heads: config.n_kv_head,
            seq_len,
            head_dim: config.head_dim(),
            num_layers: config.n_layer,
        }
    }
}

/// Key/value buffers for a single layer.
#[derive(Debug, Clone)]
struct LayerCache {
    /// Keys: [batch, num_kv_heads, capacity, head_dim]
    key: Tensor,
    /// Values: [batch, num_kv_heads, capacity, head_dim]
    value: Tensor,
}

impl LayerCache {
    fn zeros(
        config: &KvCacheConfig,
        capacity: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (
            config.batch_size,
            config.num_kv_heads,
            capacity,
            config.head_dim,
        );
        Ok(Self {
            key: Tensor::zeros(shape, dtype, device)?,
            value: Tensor::zeros(shape, dtype, device)?,
        })
    }
}

/// Growable KV cache shared by all layers of one decoding session.
#[derive(Debug)]
pub struct KvCache {
    config: KvCacheConfig,
    layers: Vec<LayerCache>,
    capacity: usize,
    position: usize,
    dtype: DType,
    device: Device,
}

impl KvCache {
    /// Allocate a zeroed cache with `config.seq_len` positions of capacity.
    pub fn new(config: KvCacheConfig, dtype: DType, device: &Device) -> Result<Self> {
        let capacity = config.seq_len;
        let layers = (0..config.num_layers)
            .map(|_| LayerCache::zeros(&config, capacity, dtype, device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            layers,
            capacity,
            position: 0,
            dtype,
            device: device.clone(),
        })
    }

    /// Write `key`/`value` (`[batch, num_kv_heads, new_tokens, head_dim]`) for
    /// `layer_idx` at the current position.
    ///
    /// Returns views over every committed position of this layer, including
    /// the ones just written.
    pub fn insert(
        &mut self,
        layer_idx: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        if layer_idx >= self.layers.len() {
            return Err(NanochatError::State(format!(
                "layer index {layer_idx} out of range for a cache with {} layers",
                self.layers.len()
            )));
        }
        self.check_incoming("key", key)?;
        self.check_incoming("value", value)?;
        if key.dims() != value.dims() {
            return Err(NanochatError::State(format!(
                "key {:?} and value {:?} shapes differ",
                key.dims(),
                value.dims()
            )));
        }

        let start = self.position;
        let end = start + key.dim(2)?;
        if end > self.capacity {
            self.grow(end)?;
        }

        let layer = &self.layers[layer_idx];
        layer.key.slice_set(&key.contiguous()?, 2, start)?;
        layer.value.slice_set(&value.contiguous()?, 2, start)?;
        let key_view = layer.key.narrow(2, 0, end)?;
        let value_view = layer.value.narrow(2, 0, end)?;

        if layer_idx + 1 == self.layers.len() {
            self.position = end;
        }

        Ok((key_view, value_view))
    }

    /// Reallocate every layer so that at least `needed` positions fit.
    fn grow(&mut self, needed: usize) -> Result<()> {
        let new_capacity = (needed + GROWTH_STEP).div_ceil(GROWTH_STEP) * GROWTH_STEP;
        tracing::debug!(
            old_capacity = self.capacity,
            new_capacity,
            position = self.position,
            "growing kv cache"
        );

        for layer in &mut self.layers {
            let grown = LayerCache::zeros(&self.config, new_capacity, self.dtype, &self.device)?;
            grown.key.slice_set(&layer.key, 2, 0)?;
            grown.value.slice_set(&layer.value, 2, 0)?;
            *layer = grown;
        }
        self.capacity = new_capacity;
        Ok(())
    }

    fn check_incoming(&self, what: &str, tensor: &Tensor) -> Result<()> {
        if !tensor.device().same_device(&self.device) {
            return Err(NanochatError::State(format!(
                "{what} is on {:?} but the cache lives on {:?}",
                tensor.device(),
                self.device
            )));
        }
        if tensor.dtype() != self.dtype {
            return Err(NanochatError::State(format!(
                "{what} has dtype {:?} but the cache stores {:?}",
                tensor.dtype(),
                self.dtype
            )));
        }
        let dims = tensor.dims();
        let expected = [
            self.config.batch_size,
            self.config.num_kv_heads,
            self.config.head_dim,
        ];
        if dims.len() != 4 || [dims[0], dims[1], dims[3]] != expected {
            return Err(NanochatError::State(format!(
                "{what} shape {dims:?} does not match cache geometry [{}, {}, _, {}]",
                expected[0], expected[1], expected[2]
            )));
        }
        Ok(())
    }

    /// Rewind to position 0, keeping the allocated storage.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Number of committed positions.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Positions that fit before the next reallocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Cache geometry.
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Element type of the buffers.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device of the buffers.
    pub fn device(&self) -> &Device {
        &self.device
    }
}
