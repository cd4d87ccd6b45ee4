//! Post-hoc static group quantization.
//!
//! Runs after sanitization and before verification. Symmetric per-group
//! quantization along the trailing axis: each group of `group_size`
//! consecutive values shares one f32 scale; values are stored as signed
//! integers and widened back to f32 when the module tree is populated.
//! Only parameters whose trailing dimension divides the group size are
//! eligible; everything else is left untouched.

use tracing::info;

use super::{RawTensor, TensorMap};
use crate::error::{EngineError, Result};
use crate::models::config::QuantizationConfig;

/// One quantized group block: scale plus packed values.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub shape: Vec<usize>,
    pub group_size: usize,
    pub scales: Vec<f32>,
    pub values: Vec<i8>,
}

/// Quantize values in groups along the trailing axis.
pub fn quantize_groups(raw: &RawTensor, group_size: usize, bits: u8) -> Result<QuantizedTensor> {
    if group_size == 0 || raw.trailing_dim() % group_size != 0 {
        return Err(EngineError::WeightMismatch(format!(
            "trailing dim {} does not divide group size {group_size}",
            raw.trailing_dim()
        )));
    }
    let max_q = match bits {
        8 => 127.0f32,
        4 => 7.0f32,
        other => {
            return Err(EngineError::Configuration(format!(
                "unsupported quantization width: {other} bits"
            )))
        }
    };

    let n_groups = raw.numel() / group_size;
    let mut scales = Vec::with_capacity(n_groups);
    let mut values = Vec::with_capacity(raw.numel());

    for group in raw.data.chunks_exact(group_size) {
        let absmax = group.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = if absmax > 0.0 { absmax / max_q } else { 1.0 };
        scales.push(scale);
        for &v in group {
            values.push((v / scale).round().clamp(-max_q, max_q) as i8);
        }
    }

    Ok(QuantizedTensor {
        shape: raw.shape.clone(),
        group_size,
        scales,
        values,
    })
}

/// Widen a quantized tensor back to f32.
pub fn dequantize(q: &QuantizedTensor) -> RawTensor {
    let mut data = Vec::with_capacity(q.values.len());
    for (group_idx, group) in q.values.chunks_exact(q.group_size).enumerate() {
        let scale = q.scales[group_idx];
        data.extend(group.iter().map(|&v| v as f32 * scale));
    }
    RawTensor::new(q.shape.clone(), data)
}

/// Apply post-hoc quantization in place across a sanitized tensor map.
///
/// Returns the number of parameters quantized. Population consumes the
/// dequantized values, so downstream verification and module construction
/// are unchanged.
pub fn apply(map: &mut TensorMap, config: &QuantizationConfig) -> Result<usize> {
    let mut quantized = 0usize;
    let names: Vec<String> = map.keys().cloned().collect();

    for name in names {
        let eligible = {
            let raw = &map[&name];
            raw.trailing_dim() > 0 && raw.trailing_dim() % config.group_size == 0
        };
        if !eligible {
            continue;
        }
        let raw = map.remove(&name).expect("listed key");
        let q = quantize_groups(&raw, config.group_size, config.bits)?;
        map.insert(name, dequantize(&q));
        quantized += 1;
    }

    info!(
        params = quantized,
        group_size = config.group_size,
        bits = config.bits,
        "applied post-hoc quantization"
    );
    Ok(quantized)
}
