use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::state::StateLayout;
use crate::error::{ErrorFlags, RwkvError, RwkvResult};

/// Recurrence formulation selected once from the architecture version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchVariant {
    /// Version 4: three per-channel accumulators with a running log-domain maximum.
    V4,
    /// Version 5 and later: one matrix-valued accumulator per head.
    V5,
}

/// Model-wide hyperparameters read from the checkpoint header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwkvConfig {
    pub n_vocab: usize,
    pub n_embed: usize,
    pub n_layer: usize,
    pub ffn_dim: usize,
    pub arch_version_major: u32,
    #[serde(default)]
    pub arch_version_minor: u32,
    #[serde(default)]
    pub head_count: usize,
    #[serde(default)]
    pub head_size: usize,
}

impl Default for RwkvConfig {
    fn default() -> Self {
        RwkvConfig::v4(50277, 768, 12)
    }
}

impl RwkvConfig {
    /// Version 4 configuration with the customary `4 * n_embed` feed-forward width.
    pub fn v4(n_vocab: usize, n_embed: usize, n_layer: usize) -> Self {
        RwkvConfig {
            n_vocab,
            n_embed,
            n_layer,
            ffn_dim: 4 * n_embed,
            arch_version_major: 4,
            arch_version_minor: 0,
            head_count: 0,
            head_size: 0,
        }
    }

    /// Version `5.minor` configuration; `n_embed` must be a multiple of `head_size`.
    ///
    /// The feed-forward width defaults to `4 * n_embed`; 5.2 checkpoints usually need `ffn_dim`
    /// overridden.
    pub fn v5(
        n_vocab: usize,
        n_embed: usize,
        n_layer: usize,
        head_size: usize,
        minor: u32,
    ) -> Self {
        RwkvConfig {
            n_vocab,
            n_embed,
            n_layer,
            ffn_dim: 4 * n_embed,
            arch_version_major: 5,
            arch_version_minor: minor,
            head_count: if head_size == 0 { 0 } else { n_embed / head_size },
            head_size,
        }
    }

    pub fn variant(&self) -> ArchVariant {
        if self.arch_version_major >= 5 {
            ArchVariant::V5
        } else {
            ArchVariant::V4
        }
    }

    /// Whether the attention output is gated by `silu(W_gate * xg)`.
    pub fn has_gate(&self) -> bool {
        self.arch_version_major >= 5 && self.arch_version_minor >= 2
    }

    /// Epsilon of the per-head group norm applied to the matrix-state readout.
    pub fn group_norm_eps(&self) -> f32 {
        if self.arch_version_minor >= 2 {
            64e-5
        } else {
            1e-5
        }
    }

    pub fn state_layout(&self) -> StateLayout {
        StateLayout::new(self)
    }

    /// Number of `f32` elements in one state buffer.
    pub fn state_len(&self) -> usize {
        self.state_layout().state_len()
    }

    pub fn validate(&self) -> RwkvResult<()> {
        let invalid = |message: String| {
            Err(RwkvError::model(
                ErrorFlags::MODEL | ErrorFlags::DATA,
                message,
            ))
        };
        if self.n_vocab == 0 || self.n_embed == 0 || self.n_layer == 0 || self.ffn_dim == 0 {
            return invalid(format!(
                "model sizes must be positive: n_vocab={}, n_embed={}, n_layer={}, ffn_dim={}",
                self.n_vocab, self.n_embed, self.n_layer, self.ffn_dim
            ));
        }
        if self.n_vocab > i32::MAX as usize {
            return invalid(format!("n_vocab {} exceeds the token id range", self.n_vocab));
        }
        if self.arch_version_major < 4 {
            return Err(RwkvError::model(
                ErrorFlags::MODEL | ErrorFlags::UNSUPPORTED,
                format!(
                    "architecture version {}.{} is not supported",
                    self.arch_version_major, self.arch_version_minor
                ),
            ));
        }
        if self.variant() == ArchVariant::V5 {
            if self.head_count == 0 || self.head_size == 0 {
                return invalid("version 5 models need a positive head count and head size".into());
            }
            if self.head_count * self.head_size != self.n_embed {
                return invalid(format!(
                    "{} heads of size {} do not cover n_embed={}",
                    self.head_count, self.head_size, self.n_embed
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RwkvConfig =
            serde_json::from_str(json).context("failed to parse RWKV config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        RwkvConfig::from_json_str(&json)
            .with_context(|| format!("invalid config {}", path.display()))
    }
}
