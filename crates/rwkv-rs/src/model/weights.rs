//! Weight table of an RWKV model and its assembly from named checkpoint tensors.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use rand::Rng;

use super::config::{ArchVariant, RwkvConfig};
use crate::error::{ErrorFlags, RwkvError, RwkvResult};
use crate::tensor::{HostTensor, Shape};

/// Scale and shift of one layer norm.
#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub weight: Arc<HostTensor>,
    pub bias: Arc<HostTensor>,
}

/// Channel-mix (feed-forward) weights, identical in both variants.
#[derive(Debug, Clone)]
pub struct ChannelMixWeights {
    pub time_mix_k: Arc<HostTensor>,
    pub time_mix_r: Arc<HostTensor>,
    /// `[n_embed, ffn_dim]`
    pub key: Arc<HostTensor>,
    /// `[ffn_dim, n_embed]`
    pub value: Arc<HostTensor>,
    pub receptance: Arc<HostTensor>,
}

/// Time-mix weights of a version 4 block.
///
/// `time_decay` is stored in evaluation form, i.e. already `-exp(raw)`.
#[derive(Debug, Clone)]
pub struct TimeMixV4Weights {
    pub time_mix_k: Arc<HostTensor>,
    pub time_mix_v: Arc<HostTensor>,
    pub time_mix_r: Arc<HostTensor>,
    pub time_first: Arc<HostTensor>,
    pub time_decay: Arc<HostTensor>,
    pub key: Arc<HostTensor>,
    pub value: Arc<HostTensor>,
    pub receptance: Arc<HostTensor>,
    pub output: Arc<HostTensor>,
}

/// Output gate of version 5.2 and later.
#[derive(Debug, Clone)]
pub struct GateWeights {
    pub time_mix_g: Arc<HostTensor>,
    pub gate: Arc<HostTensor>,
}

/// Time-mix weights of a version 5 block.
///
/// `time_first` and `time_decay` are `[1, head_size, head_count]`; the decay is stored in
/// evaluation form, i.e. already `exp(-exp(raw))`.
#[derive(Debug, Clone)]
pub struct TimeMixV5Weights {
    pub time_mix_k: Arc<HostTensor>,
    pub time_mix_v: Arc<HostTensor>,
    pub time_mix_r: Arc<HostTensor>,
    pub time_first: Arc<HostTensor>,
    pub time_decay: Arc<HostTensor>,
    pub key: Arc<HostTensor>,
    pub value: Arc<HostTensor>,
    pub receptance: Arc<HostTensor>,
    pub output: Arc<HostTensor>,
    pub ln_x: LayerNormWeights,
    pub gate: Option<GateWeights>,
}

#[derive(Debug, Clone)]
pub enum TimeMixWeights {
    V4(TimeMixV4Weights),
    V5(TimeMixV5Weights),
}

#[derive(Debug, Clone)]
pub struct BlockWeights {
    pub ln1: LayerNormWeights,
    pub att: TimeMixWeights,
    pub ln2: LayerNormWeights,
    pub ffn: ChannelMixWeights,
}

/// Immutable model shared by every context evaluating it.
#[derive(Debug)]
pub struct RwkvModel {
    pub config: RwkvConfig,
    /// `[n_embed, n_vocab]`
    pub emb: Arc<HostTensor>,
    pub ln0: LayerNormWeights,
    pub blocks: Vec<BlockWeights>,
    pub ln_out: LayerNormWeights,
    /// `[n_embed, n_vocab]`
    pub head: Arc<HostTensor>,
}

struct NamedTensors {
    tensors: HashMap<String, HostTensor>,
}

impl NamedTensors {
    fn take(&mut self, name: &str) -> RwkvResult<HostTensor> {
        self.tensors.remove(name).ok_or_else(|| {
            RwkvError::model(
                ErrorFlags::MODEL_PARAMS | ErrorFlags::PARAM_MISSING,
                format!("missing tensor {name} in checkpoint"),
            )
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Takes a tensor with `dims` elements in total and gives it exactly that shape.
    fn flattened(&mut self, name: &str, dims: &[usize]) -> RwkvResult<Arc<HostTensor>> {
        let tensor = self.take(name)?;
        let shape = Shape::from_slice(dims);
        if tensor.len() != shape.num_elements() {
            return Err(RwkvError::model(
                ErrorFlags::MODEL_PARAMS | ErrorFlags::DIMENSION,
                format!(
                    "tensor {name} has {} elements, expected {}",
                    tensor.len(),
                    shape.num_elements()
                ),
            ));
        }
        Ok(Arc::new(tensor.reshape(shape)?))
    }

    fn vector(&mut self, name: &str, len: usize) -> RwkvResult<Arc<HostTensor>> {
        self.flattened(name, &[len])
    }

    /// Takes a `[ne0, ne1]` matrix; `ne0` is the input width of a projection.
    fn matrix(&mut self, name: &str, ne0: usize, ne1: usize) -> RwkvResult<Arc<HostTensor>> {
        let tensor = self.take(name)?;
        if tensor.shape().padded() != [ne0, ne1, 1, 1] {
            return Err(RwkvError::model(
                ErrorFlags::MODEL_PARAMS | ErrorFlags::SHAPE,
                format!(
                    "tensor {name} has shape {:?}, expected [{ne0}, {ne1}]",
                    tensor.shape().dims()
                ),
            ));
        }
        Ok(Arc::new(tensor))
    }

    fn layer_norm(&mut self, prefix: &str, len: usize) -> RwkvResult<LayerNormWeights> {
        Ok(LayerNormWeights {
            weight: self.vector(&format!("{prefix}.weight"), len)?,
            bias: self.vector(&format!("{prefix}.bias"), len)?,
        })
    }
}

impl RwkvModel {
    /// Assembles the model from tensors keyed by their checkpoint names.
    ///
    /// Vectors may come in any shape with the right element count; matrices must already be in
    /// `[in, out]` element order. Unused tensors are ignored.
    pub fn from_named_tensors(
        config: RwkvConfig,
        tensors: HashMap<String, HostTensor>,
    ) -> RwkvResult<Self> {
        config.validate()?;
        let mut tensors = NamedTensors { tensors };
        let n_embed = config.n_embed;

        let emb = tensors.matrix("emb.weight", n_embed, config.n_vocab)?;
        let ln0 = tensors.layer_norm("blocks.0.ln0", n_embed)?;
        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer in 0..config.n_layer {
            let prefix = format!("blocks.{layer}");
            let ln1 = tensors.layer_norm(&format!("{prefix}.ln1"), n_embed)?;
            let att = match config.variant() {
                ArchVariant::V4 => {
                    TimeMixWeights::V4(load_time_mix_v4(&mut tensors, &prefix, n_embed)?)
                }
                ArchVariant::V5 => {
                    TimeMixWeights::V5(load_time_mix_v5(&mut tensors, &prefix, &config)?)
                }
            };
            let ln2 = tensors.layer_norm(&format!("{prefix}.ln2"), n_embed)?;
            let ffn_name = |field: &str| format!("{prefix}.ffn.{field}");
            let ffn = ChannelMixWeights {
                time_mix_k: tensors.vector(&ffn_name("time_mix_k"), n_embed)?,
                time_mix_r: tensors.vector(&ffn_name("time_mix_r"), n_embed)?,
                key: tensors.matrix(&ffn_name("key.weight"), n_embed, config.ffn_dim)?,
                value: tensors.matrix(&ffn_name("value.weight"), config.ffn_dim, n_embed)?,
                receptance: tensors.matrix(&ffn_name("receptance.weight"), n_embed, n_embed)?,
            };
            blocks.push(BlockWeights { ln1, att, ln2, ffn });
        }
        let ln_out = tensors.layer_norm("ln_out", n_embed)?;
        let head = tensors.matrix("head.weight", n_embed, config.n_vocab)?;

        if !tensors.tensors.is_empty() {
            let mut unused: Vec<&str> = tensors.tensors.keys().map(String::as_str).collect();
            unused.sort_unstable();
            debug!("ignoring {} unused checkpoint tensors: {:?}", unused.len(), unused);
        }

        Ok(RwkvModel {
            config,
            emb,
            ln0,
            blocks,
            ln_out,
            head,
        })
    }

    /// Builds a randomly initialised model, mainly for tests and benchmarks.
    pub fn random(config: RwkvConfig, rng: &mut impl Rng) -> RwkvResult<Self> {
        config.validate()?;
        let tensors = random_named_tensors(&config, rng);
        RwkvModel::from_named_tensors(config, tensors)
    }

    pub fn config(&self) -> &RwkvConfig {
        &self.config
    }

    pub fn variant(&self) -> ArchVariant {
        self.config.variant()
    }
}

fn load_time_mix_v4(
    tensors: &mut NamedTensors,
    prefix: &str,
    n_embed: usize,
) -> RwkvResult<TimeMixV4Weights> {
    let name = |field: &str| format!("{prefix}.att.{field}");
    Ok(TimeMixV4Weights {
        time_mix_k: tensors.vector(&name("time_mix_k"), n_embed)?,
        time_mix_v: tensors.vector(&name("time_mix_v"), n_embed)?,
        time_mix_r: tensors.vector(&name("time_mix_r"), n_embed)?,
        time_first: tensors.vector(&name("time_first"), n_embed)?,
        time_decay: tensors.vector(&name("time_decay"), n_embed)?,
        key: tensors.matrix(&name("key.weight"), n_embed, n_embed)?,
        value: tensors.matrix(&name("value.weight"), n_embed, n_embed)?,
        receptance: tensors.matrix(&name("receptance.weight"), n_embed, n_embed)?,
        output: tensors.matrix(&name("output.weight"), n_embed, n_embed)?,
    })
}

fn load_time_mix_v5(
    tensors: &mut NamedTensors,
    prefix: &str,
    config: &RwkvConfig,
) -> RwkvResult<TimeMixV5Weights> {
    let n_embed = config.n_embed;
    let per_head = [1, config.head_size, config.head_count];
    let name = |field: &str| format!("{prefix}.att.{field}");

    let faaaa = name("time_faaaa");
    let legacy = name("time_first");
    let time_first = match (tensors.contains(&faaaa), tensors.contains(&legacy)) {
        (true, true) => {
            let current = tensors.flattened(&faaaa, &per_head)?;
            let older = tensors.take(&legacy)?;
            if older.data() != current.data() {
                return Err(RwkvError::model(
                    ErrorFlags::MODEL_PARAMS | ErrorFlags::DATA,
                    format!("{faaaa} and {legacy} are both present with different values"),
                ));
            }
            warn!("{faaaa} and {legacy} are both present; using {faaaa}");
            current
        }
        (true, false) => tensors.flattened(&faaaa, &per_head)?,
        (false, _) => tensors.flattened(&legacy, &per_head)?,
    };

    let gate_mix = name("time_mix_g");
    let gate_weight = name("gate.weight");
    let gate = if config.has_gate() {
        Some(GateWeights {
            time_mix_g: tensors.vector(&gate_mix, n_embed)?,
            gate: tensors.matrix(&gate_weight, n_embed, n_embed)?,
        })
    } else if tensors.contains(&gate_mix) || tensors.contains(&gate_weight) {
        return Err(RwkvError::model(
            ErrorFlags::MODEL_PARAMS | ErrorFlags::UNSUPPORTED,
            format!(
                "{prefix} carries gate tensors, which version {}.{} models do not use",
                config.arch_version_major, config.arch_version_minor
            ),
        ));
    } else {
        None
    };

    Ok(TimeMixV5Weights {
        time_mix_k: tensors.vector(&name("time_mix_k"), n_embed)?,
        time_mix_v: tensors.vector(&name("time_mix_v"), n_embed)?,
        time_mix_r: tensors.vector(&name("time_mix_r"), n_embed)?,
        time_first,
        time_decay: tensors.flattened(&name("time_decay"), &per_head)?,
        key: tensors.matrix(&name("key.weight"), n_embed, n_embed)?,
        value: tensors.matrix(&name("value.weight"), n_embed, n_embed)?,
        receptance: tensors.matrix(&name("receptance.weight"), n_embed, n_embed)?,
        output: tensors.matrix(&name("output.weight"), n_embed, n_embed)?,
        ln_x: tensors.layer_norm(&name("ln_x"), n_embed)?,
        gate,
    })
}

/// Random checkpoint with the tensor names and shapes [`RwkvModel::from_named_tensors`] expects.
pub fn random_named_tensors(
    config: &RwkvConfig,
    rng: &mut impl Rng,
) -> HashMap<String, HostTensor> {
    let weight_std = 0.02;
    let n_embed = config.n_embed;
    let mut tensors = HashMap::new();
    let mut insert = |name: String, tensor: HostTensor| {
        tensors.insert(name, tensor);
    };
    let vector = Shape::new([n_embed]);
    let square = Shape::new([n_embed, n_embed]);

    insert(
        "emb.weight".into(),
        HostTensor::randn(Shape::new([n_embed, config.n_vocab]), weight_std, rng),
    );
    insert("blocks.0.ln0.weight".into(), HostTensor::ones(vector));
    insert("blocks.0.ln0.bias".into(), HostTensor::zeros(vector));
    for layer in 0..config.n_layer {
        let prefix = format!("blocks.{layer}");
        for norm in ["ln1", "ln2"] {
            insert(format!("{prefix}.{norm}.weight"), HostTensor::ones(vector));
            insert(format!("{prefix}.{norm}.bias"), HostTensor::zeros(vector));
        }
        let mut mixes = vec!["time_mix_k", "time_mix_v", "time_mix_r"];
        let mut projections = vec!["key", "value", "receptance", "output"];
        if config.has_gate() {
            mixes.push("time_mix_g");
            projections.push("gate");
        }
        for mix in mixes {
            insert(
                format!("{prefix}.att.{mix}"),
                HostTensor::uniform(vector, 0.0, 1.0, rng),
            );
        }
        for projection in projections {
            insert(
                format!("{prefix}.att.{projection}.weight"),
                HostTensor::randn(square, weight_std, rng),
            );
        }
        match config.variant() {
            ArchVariant::V4 => {
                insert(
                    format!("{prefix}.att.time_first"),
                    HostTensor::randn(vector, 0.5, rng),
                );
                insert(
                    format!("{prefix}.att.time_decay"),
                    HostTensor::randn(vector, 0.5, rng).map(|raw| -raw.exp()),
                );
            }
            ArchVariant::V5 => {
                let per_head = Shape::new([config.head_size, config.head_count]);
                insert(
                    format!("{prefix}.att.time_faaaa"),
                    HostTensor::randn(per_head, 0.5, rng),
                );
                insert(
                    format!("{prefix}.att.time_decay"),
                    HostTensor::randn(per_head, 0.5, rng).map(|raw| (-raw.exp()).exp()),
                );
                insert(format!("{prefix}.att.ln_x.weight"), HostTensor::ones(vector));
                insert(format!("{prefix}.att.ln_x.bias"), HostTensor::zeros(vector));
            }
        }
        for mix in ["time_mix_k", "time_mix_r"] {
            insert(
                format!("{prefix}.ffn.{mix}"),
                HostTensor::uniform(vector, 0.0, 1.0, rng),
            );
        }
        insert(
            format!("{prefix}.ffn.key.weight"),
            HostTensor::randn(Shape::new([n_embed, config.ffn_dim]), weight_std, rng),
        );
        insert(
            format!("{prefix}.ffn.value.weight"),
            HostTensor::randn(Shape::new([config.ffn_dim, n_embed]), weight_std, rng),
        );
        insert(
            format!("{prefix}.ffn.receptance.weight"),
            HostTensor::randn(square, weight_std, rng),
        );
    }
    insert("ln_out.weight".into(), HostTensor::ones(vector));
    insert("ln_out.bias".into(), HostTensor::zeros(vector));
    insert(
        "head.weight".into(),
        HostTensor::randn(Shape::new([n_embed, config.n_vocab]), weight_std, rng),
    );
    tensors
}
