//! Tensor-name sanitization.
//!
//! One declarative plan per architecture maps on-disk tensor names and
//! layouts to the runtime's module tree: prefix renames, conv axis-order
//! fixes, weight-norm reconstruction, and an explicit allow-list of
//! tensors to drop. Sanitization runs once, before modules are populated;
//! a strict verification pass then fails loudly on any unmatched module
//! parameter or orphan tensor.

use std::collections::HashSet;

use tracing::debug;

use super::{RawTensor, TensorMap};
use crate::error::{EngineError, Result};
use crate::models::config::Architecture;

const WEIGHT_NORM_EPS: f32 = 1e-12;

/// Declarative sanitization plan for one architecture.
#[derive(Debug, Clone)]
pub struct SanitizePlan {
    /// Prefix renames applied first, in order: `(from, to)`.
    pub renames: &'static [(&'static str, &'static str)],
    /// Name suffixes of conv kernels stored `[out, kernel, in]` on disk.
    /// The permutation is unconditional for these; the shape heuristic is
    /// consulted only where the layout is ambiguous (square trailing dims).
    pub conv_suffixes: &'static [&'static str],
    /// Name suffixes of tensors intentionally absent from the runtime
    /// (materialized rotary tables, training-only buffers). Everything
    /// else unmatched is an error, never silently dropped.
    pub drop_suffixes: &'static [&'static str],
}

/// The plan for an architecture.
pub fn plan_for(arch: Architecture) -> SanitizePlan {
    match arch {
        Architecture::ConformerCtc => SanitizePlan {
            renames: &[("model.", "")],
            conv_suffixes: &[
                "subsample.conv1.weight",
                "subsample.conv2.weight",
                "pos_conv.conv.weight",
                "conv.depthwise.weight",
                "conv.pointwise1.weight",
                "conv.pointwise2.weight",
            ],
            drop_suffixes: &["rope.inv_freq", "masked_spec_embed"],
        },
        Architecture::AudioLm | Architecture::StreamingAudioLm => SanitizePlan {
            renames: &[("model.", "")],
            conv_suffixes: &["conv1.weight", "conv2.weight"],
            drop_suffixes: &["rope.inv_freq", "rotary_emb.inv_freq"],
        },
    }
}

/// Run the full sanitization pipeline.
///
/// Order matters: renames expose the runtime names, weight-norm pairs fuse
/// before the conv permutation sees them, and drops come last so dropped
/// names are matched against their final form.
pub fn sanitize(raw: TensorMap, plan: &SanitizePlan) -> Result<TensorMap> {
    let renamed = apply_renames(raw, plan);
    let fused = reconstruct_weight_norm(renamed)?;
    let permuted = permute_conv_axes(fused, plan)?;
    Ok(apply_drops(permuted, plan))
}

fn apply_renames(raw: TensorMap, plan: &SanitizePlan) -> TensorMap {
    raw.into_iter()
        .map(|(name, tensor)| {
            let mut name = name;
            for (from, to) in plan.renames {
                if let Some(rest) = name.strip_prefix(from) {
                    name = format!("{to}{rest}");
                }
            }
            (name, tensor)
        })
        .collect()
}

/// Fuse `weight_g`/`weight_v` pairs into plain `weight` tensors.
///
/// `w = g * v / (||v|| + eps)` with the norm over all axes except the
/// output-channel axis. Reconstructed exactly once here, never in the
/// forward pass.
fn reconstruct_weight_norm(mut map: TensorMap) -> Result<TensorMap> {
    let v_names: Vec<String> = map
        .keys()
        .filter(|k| k.ends_with(".weight_v"))
        .cloned()
        .collect();

    for v_name in v_names {
        let base = v_name.trim_end_matches(".weight_v").to_string();
        let g_name = format!("{base}.weight_g");
        let v = map.remove(&v_name).expect("listed key");
        let g = map.remove(&g_name).ok_or_else(|| {
            EngineError::WeightMismatch(format!("{v_name} present without {g_name}"))
        })?;

        let out_channels = v.shape[0];
        if g.numel() != out_channels {
            return Err(EngineError::WeightMismatch(format!(
                "{g_name}: expected {out_channels} magnitudes, got shape {:?}",
                g.shape
            )));
        }

        let norms = v.norm_per_out_channel();
        let per = v.numel() / out_channels;
        let mut data = v.data;
        for o in 0..out_channels {
            let scale = g.data[o] / (norms[o] + WEIGHT_NORM_EPS);
            for val in &mut data[o * per..(o + 1) * per] {
                *val *= scale;
            }
        }
        debug!(tensor = %base, "reconstructed weight-normalized parameters");
        map.insert(format!("{base}.weight"), RawTensor::new(v.shape, data));
    }

    // Orphan magnitudes mean the pairing is broken.
    if let Some(orphan) = map.keys().find(|k| k.ends_with(".weight_g")) {
        return Err(EngineError::WeightMismatch(format!(
            "{orphan} present without matching weight_v"
        )));
    }
    Ok(map)
}

fn permute_conv_axes(map: TensorMap, plan: &SanitizePlan) -> Result<TensorMap> {
    map.into_iter()
        .map(|(name, tensor)| {
            let is_conv = plan.conv_suffixes.iter().any(|s| name.ends_with(s));
            if is_conv {
                let permuted = tensor.permute_021()?;
                Ok((name, permuted))
            } else {
                Ok((name, tensor))
            }
        })
        .collect()
}

fn apply_drops(map: TensorMap, plan: &SanitizePlan) -> TensorMap {
    map.into_iter()
        .filter(|(name, _)| {
            let dropped = plan.drop_suffixes.iter().any(|s| name.ends_with(s));
            if dropped {
                debug!(tensor = %name, "dropping allow-listed tensor");
            }
            !dropped
        })
        .collect()
}

/// Strict two-way verification of sanitized tensors against the module
/// tree's expected parameter names.
pub fn verify(tensors: &TensorMap, expected: &[String]) -> Result<()> {
    let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();

    let mut missing: Vec<&str> = expected_set
        .iter()
        .filter(|name| !tensors.contains_key(**name))
        .copied()
        .collect();
    missing.sort_unstable();
    if !missing.is_empty() {
        return Err(EngineError::WeightMismatch(format!(
            "{} module parameters have no tensor: {}",
            missing.len(),
            missing.join(", ")
        )));
    }

    let mut orphans: Vec<&str> = tensors
        .keys()
        .map(String::as_str)
        .filter(|name| !expected_set.contains(*name))
        .collect();
    orphans.sort_unstable();
    if !orphans.is_empty() {
        return Err(EngineError::WeightMismatch(format!(
            "{} orphan tensors not consumed by any module: {}",
            orphans.len(),
            orphans.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(entries: &[(&str, RawTensor)]) -> TensorMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_renames_strip_prefix() {
        let plan = plan_for(Architecture::StreamingAudioLm);
        let raw = map_of(&[(
            "model.decoder.norm.weight",
            RawTensor::new(vec![4], vec![1.0; 4]),
        )]);
        let out = sanitize(raw, &plan).unwrap();
        assert!(out.contains_key("decoder.norm.weight"));
    }

    #[test]
    fn test_weight_norm_reconstruction_matches_direct() {
        let plan = plan_for(Architecture::ConformerCtc);
        // v: [2, 1, 3] direction, g: [2] magnitude. Named so the conv
        // permutation does not touch it.
        let v = RawTensor::new(vec![2, 1, 3], vec![1.0, 2.0, 2.0, 0.0, 3.0, 4.0]);
        let g = RawTensor::new(vec![2], vec![6.0, 10.0]);
        let raw = map_of(&[
            ("encoder.proj.weight_v", v.clone()),
            ("encoder.proj.weight_g", g.clone()),
        ]);

        let out = sanitize(raw, &plan).unwrap();
        let w = out.get("encoder.proj.weight").expect("fused weight");

        // Direct computation: g * v / (norm(v) + eps)
        for o in 0..2 {
            let norm: f32 = v.data[o * 3..(o + 1) * 3]
                .iter()
                .map(|x| x * x)
                .sum::<f32>()
                .sqrt();
            for i in 0..3 {
                let direct = g.data[o] * v.data[o * 3 + i] / (norm + WEIGHT_NORM_EPS);
                let got = w.data[o * 3 + i];
                assert!(
                    (direct - got).abs() < 1e-4,
                    "channel {o} elem {i}: {direct} vs {got}"
                );
            }
        }
    }

    #[test]
    fn test_orphan_weight_g_rejected() {
        let plan = plan_for(Architecture::ConformerCtc);
        let raw = map_of(&[(
            "encoder.proj.weight_g",
            RawTensor::new(vec![2], vec![1.0, 1.0]),
        )]);
        assert!(matches!(
            sanitize(raw, &plan),
            Err(EngineError::WeightMismatch(_))
        ));
    }

    #[test]
    fn test_conv_axes_permuted() {
        let plan = plan_for(Architecture::StreamingAudioLm);
        // Disk layout [out=1, kernel=3, in=2]
        let raw = map_of(&[(
            "encoder.conv1.weight",
            RawTensor::new(vec![1, 3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        )]);
        let out = sanitize(raw, &plan).unwrap();
        let w = out.get("encoder.conv1.weight").unwrap();
        assert_eq!(w.shape, vec![1, 2, 3]);
        // column-major walk of the original [3, 2] block
        assert_eq!(w.data, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_drop_allow_list() {
        let plan = plan_for(Architecture::StreamingAudioLm);
        let raw = map_of(&[
            ("decoder.layers.0.rope.inv_freq", RawTensor::new(vec![2], vec![0.0; 2])),
            ("decoder.norm.weight", RawTensor::new(vec![2], vec![1.0; 2])),
        ]);
        let out = sanitize(raw, &plan).unwrap();
        assert!(!out.contains_key("decoder.layers.0.rope.inv_freq"));
        assert!(out.contains_key("decoder.norm.weight"));
    }

    #[test]
    fn test_verify_reports_missing_and_orphans() {
        let tensors = map_of(&[("a.weight", RawTensor::new(vec![1], vec![0.0]))]);

        let err = verify(&tensors, &["a.weight".into(), "b.weight".into()]).unwrap_err();
        assert!(err.to_string().contains("b.weight"));

        let err = verify(&tensors, &[]).unwrap_err();
        assert!(err.to_string().contains("orphan"));
        assert!(err.to_string().contains("a.weight"));

        verify(&tensors, &["a.weight".into()]).unwrap();
    }
}
