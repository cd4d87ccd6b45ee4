//! Raw tensor loading from safetensors packages.
//!
//! Supports a single `model.safetensors` file or a sharded package indexed
//! by `model.safetensors.index.json` (tensor name -> shard file); both load
//! transparently into the same in-memory map. F16/BF16 shards are widened
//! to f32 once at load time.

pub mod quantize;
pub mod sanitize;

use std::collections::HashMap;
use std::path::Path;

use burn::module::{Ignored, Param, ParamId};
use burn::nn::conv::Conv1d;
use burn::nn::{Linear, PaddingConfig1d};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use safetensors::SafeTensors;

use crate::error::{EngineError, Result};

/// Single-file package name.
pub const SINGLE_FILE: &str = "model.safetensors";
/// Sharded-package manifest name.
pub const INDEX_FILE: &str = "model.safetensors.index.json";

/// A CPU-side tensor: shape plus f32 data in row-major order.
#[derive(Debug, Clone)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Trailing dimension, or 0 for rank-0 tensors.
    pub fn trailing_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Permute a rank-3 tensor's last two axes:
    /// `[out, kernel, in]` -> `[out, in, kernel]`.
    pub fn permute_021(&self) -> Result<RawTensor> {
        if self.shape.len() != 3 {
            return Err(EngineError::WeightMismatch(format!(
                "conv axis permutation expects rank 3, got shape {:?}",
                self.shape
            )));
        }
        let (d0, d1, d2) = (self.shape[0], self.shape[1], self.shape[2]);
        let mut data = vec![0.0f32; self.data.len()];
        for a in 0..d0 {
            for b in 0..d1 {
                for c in 0..d2 {
                    data[a * d1 * d2 + c * d1 + b] = self.data[a * d1 * d2 + b * d2 + c];
                }
            }
        }
        Ok(RawTensor::new(vec![d0, d2, d1], data))
    }

    /// L2 norm over all axes except the leading one.
    pub fn norm_per_out_channel(&self) -> Vec<f32> {
        let out_channels = self.shape.first().copied().unwrap_or(1);
        let per = self.data.len() / out_channels.max(1);
        (0..out_channels)
            .map(|o| {
                self.data[o * per..(o + 1) * per]
                    .iter()
                    .map(|v| v * v)
                    .sum::<f32>()
                    .sqrt()
            })
            .collect()
    }
}

/// Name -> tensor map produced by loading and consumed by sanitization.
pub type TensorMap = HashMap<String, RawTensor>;

/// Load every tensor in a model package directory.
pub fn load_tensors(dir: &Path) -> Result<TensorMap> {
    let single = dir.join(SINGLE_FILE);
    let index = dir.join(INDEX_FILE);

    if index.exists() {
        load_sharded(dir, &index)
    } else if single.exists() {
        let mut map = TensorMap::new();
        read_shard(&single, &mut map)?;
        Ok(map)
    } else {
        Err(EngineError::WeightMismatch(format!(
            "no {SINGLE_FILE} or {INDEX_FILE} in {}",
            dir.display()
        )))
    }
}

fn load_sharded(dir: &Path, index_path: &Path) -> Result<TensorMap> {
    let content =
        std::fs::read_to_string(index_path).map_err(|e| EngineError::io(index_path, e))?;
    let index: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        EngineError::WeightMismatch(format!("malformed shard index {}: {e}", index_path.display()))
    })?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| {
            EngineError::WeightMismatch(format!(
                "shard index {} missing weight_map",
                index_path.display()
            ))
        })?;

    // Read each shard once, regardless of how many tensors point at it.
    let mut shards: Vec<&str> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .collect();
    shards.sort_unstable();
    shards.dedup();

    let mut map = TensorMap::new();
    for shard in shards {
        read_shard(&dir.join(shard), &mut map)?;
    }

    // Every indexed tensor must have materialized.
    for name in weight_map.keys() {
        if !map.contains_key(name) {
            return Err(EngineError::WeightMismatch(format!(
                "tensor {name} listed in index but absent from its shard"
            )));
        }
    }
    Ok(map)
}

fn read_shard(path: &Path, map: &mut TensorMap) -> Result<()> {
    let bytes = std::fs::read(path).map_err(|e| EngineError::io(path, e))?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| {
        EngineError::WeightMismatch(format!("failed to parse {}: {e}", path.display()))
    })?;

    for (name, view) in tensors.tensors() {
        let shape = view.shape().to_vec();
        let data: Vec<f32> = match view.dtype() {
            safetensors::Dtype::F32 => view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            safetensors::Dtype::F16 => view
                .data()
                .chunks_exact(2)
                .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            safetensors::Dtype::BF16 => view
                .data()
                .chunks_exact(2)
                .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            other => {
                return Err(EngineError::WeightMismatch(format!(
                    "tensor {name} has unsupported dtype {other:?}"
                )))
            }
        };
        map.insert(name.to_string(), RawTensor::new(shape, data));
    }
    Ok(())
}

/// Take a tensor out of the map, failing loudly when absent.
pub fn take(map: &mut TensorMap, name: &str) -> Result<RawTensor> {
    map.remove(name)
        .ok_or_else(|| EngineError::WeightMismatch(format!("missing tensor {name}")))
}

/// Take a tensor that may legitimately be absent (config-gated biases).
pub fn take_optional(map: &mut TensorMap, name: &str) -> Option<RawTensor> {
    map.remove(name)
}

fn expect_rank(raw: &RawTensor, rank: usize, name: &str) -> Result<()> {
    if raw.shape.len() != rank {
        return Err(EngineError::WeightMismatch(format!(
            "tensor {name}: expected rank {rank}, got shape {:?}",
            raw.shape
        )));
    }
    Ok(())
}

/// Materialize a rank-1 tensor on the device.
pub fn to_tensor1<B: Backend>(raw: RawTensor, name: &str, device: &B::Device) -> Result<Tensor<B, 1>> {
    expect_rank(&raw, 1, name)?;
    Ok(Tensor::from_data(TensorData::new(raw.data, raw.shape), device))
}

/// Materialize a rank-2 tensor on the device.
pub fn to_tensor2<B: Backend>(raw: RawTensor, name: &str, device: &B::Device) -> Result<Tensor<B, 2>> {
    expect_rank(&raw, 2, name)?;
    Ok(Tensor::from_data(TensorData::new(raw.data, raw.shape), device))
}

/// Materialize a rank-3 tensor on the device.
pub fn to_tensor3<B: Backend>(raw: RawTensor, name: &str, device: &B::Device) -> Result<Tensor<B, 3>> {
    expect_rank(&raw, 3, name)?;
    Ok(Tensor::from_data(TensorData::new(raw.data, raw.shape), device))
}

/// Build a Linear from a `[out, in]` checkpoint weight.
///
/// Burn stores Linear weights `[in, out]`, so the kernel is transposed here
/// exactly once.
pub fn linear_from_raw<B: Backend>(
    weight: RawTensor,
    bias: Option<RawTensor>,
    name: &str,
    device: &B::Device,
) -> Result<Linear<B>> {
    let weight = to_tensor2::<B>(weight, name, device)?.transpose();
    let bias = match bias {
        Some(b) => Some(to_tensor1::<B>(b, name, device)?),
        None => None,
    };
    Ok(Linear {
        weight: Param::initialized(ParamId::new(), weight),
        bias: bias.map(|b| Param::initialized(ParamId::new(), b)),
    })
}

/// Build a Conv1d from a sanitized `[out, in/groups, kernel]` weight.
pub fn conv1d_from_raw<B: Backend>(
    weight: RawTensor,
    bias: Option<RawTensor>,
    stride: usize,
    groups: usize,
    padding: PaddingConfig1d,
    name: &str,
    device: &B::Device,
) -> Result<Conv1d<B>> {
    let kernel_size = weight.shape.get(2).copied().ok_or_else(|| {
        EngineError::WeightMismatch(format!("conv weight {name} is not rank 3"))
    })?;
    let weight = to_tensor3::<B>(weight, name, device)?;
    let bias = match bias {
        Some(b) => Some(to_tensor1::<B>(b, name, device)?),
        None => None,
    };
    Ok(Conv1d {
        weight: Param::initialized(ParamId::new(), weight),
        bias: bias.map(|b| Param::initialized(ParamId::new(), b)),
        stride,
        kernel_size,
        dilation: 1,
        groups,
        padding: Ignored(padding),
    })
}
