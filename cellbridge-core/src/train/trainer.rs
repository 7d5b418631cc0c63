//! Alignment training loop.
//!
//! Maps each condition's chosen representation into a shared latent space
//! and, when decoding is enabled, learns one decoder per condition back into
//! native feature space. Training is unsupervised: per-cell labels are never
//! read here. Configuration problems are rejected before the first
//! optimization step; a loss plateau is surfaced as a non-fatal warning in
//! the returned history.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::Deserialize;
use tracing::{info, warn};

use crate::dataset::{DatasetRegistry, Matrix};
use crate::error::{AlignError, Result};
use crate::models::{DecoderNet, EncoderNet, NetworkDepth};
use crate::store::{projection_tag, Artifact, EmbeddingResult, EmbeddingStore, ProjectionResult};

use super::loss::{AlignmentLoss, LossComponents};

/// Training configuration.
///
/// Deserializable so callers can keep run settings in JSON next to their
/// data; every field has a standalone default.
#[derive(Debug, Clone, Deserialize)]
pub struct AlignConfig {
    /// Number of optimization steps.
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Emit a log line every N steps. Observability only.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Z-score encoder input per condition before encoding. The statistics
    /// are frozen into the trained model and reapplied at embed time.
    #[serde(default = "default_standardize")]
    pub standardize: bool,
    /// Train per-condition decoders and produce cross-projections.
    #[serde(default)]
    pub decode: bool,
    /// Stop once the trailing-window loss stops decreasing. Leave disabled
    /// when the encoder input is a reduced representation: its scale can trip
    /// the plateau heuristic long before the latent space is aligned.
    #[serde(default)]
    pub early_stopping: bool,
    /// Trailing window length for the plateau heuristic, in steps.
    #[serde(default = "default_plateau_window")]
    pub plateau_window: usize,
    /// Relative decrease below which the window counts as flat.
    #[serde(default = "default_plateau_tol")]
    pub plateau_tol: f32,
    /// Capacity/speed selector for encoder and decoders.
    #[serde(default)]
    pub depth: NetworkDepth,
    /// Shared latent dimensionality.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Weight of the cross-condition alignment term.
    #[serde(default = "default_lambda_align")]
    pub lambda_align: f64,
    /// Weight of the reconstruction term.
    #[serde(default = "default_lambda_recon")]
    pub lambda_recon: f64,
    /// Seed for parameter initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_steps() -> usize {
    500
}
fn default_log_every() -> usize {
    50
}
fn default_standardize() -> bool {
    true
}
fn default_plateau_window() -> usize {
    25
}
fn default_plateau_tol() -> f32 {
    1e-3
}
fn default_latent_dim() -> usize {
    32
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_lambda_align() -> f64 {
    1.0
}
fn default_lambda_recon() -> f64 {
    1.0
}
fn default_seed() -> u64 {
    42
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            log_every: default_log_every(),
            standardize: default_standardize(),
            decode: false,
            early_stopping: false,
            plateau_window: default_plateau_window(),
            plateau_tol: default_plateau_tol(),
            depth: NetworkDepth::default(),
            latent_dim: default_latent_dim(),
            learning_rate: default_learning_rate(),
            lambda_align: default_lambda_align(),
            lambda_recon: default_lambda_recon(),
            seed: default_seed(),
        }
    }
}

/// Outcome of the trailing-window convergence heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Loss was still decreasing at the last check.
    Decreasing,
    /// Loss failed to decrease over the trailing window. Non-fatal: the
    /// model is returned and usable, if possibly suboptimal.
    Plateau,
}

/// Per-run record surfaced to the caller next to the trained model.
#[derive(Debug, Clone)]
pub struct TrainingHistory {
    /// Loss components for every executed step.
    pub losses: Vec<LossComponents>,
    pub steps_run: usize,
    pub early_stopped: bool,
    pub convergence: Convergence,
}

/// Frozen per-condition standardization statistics.
#[derive(Debug, Clone)]
struct ColumnStats {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ColumnStats {
    fn from_matrix(m: &Matrix) -> Self {
        let mean = m.column_means();
        let std = m.column_stds(&mean);
        Self { mean, std }
    }

    fn apply(&self, m: &Matrix, device: &Device) -> Result<Tensor> {
        let x = m.to_tensor(device)?;
        let mean = Tensor::from_slice(&self.mean, (1, self.mean.len()), device)?;
        let floored: Vec<f32> = self.std.iter().map(|s| s.max(1e-6)).collect();
        let std = Tensor::from_slice(&floored, (1, floored.len()), device)?;
        Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }
}

/// Runs training over a populated registry. The registry is only read, so
/// independent trainers may share it across threads.
pub struct AlignmentTrainer<'a> {
    registry: &'a DatasetRegistry,
    device: Device,
}

impl<'a> AlignmentTrainer<'a> {
    pub fn new(registry: &'a DatasetRegistry, device: Device) -> Self {
        Self { registry, device }
    }

    /// Train an alignment model on `encoder_input_repr`, optionally with
    /// decoders reconstructing `decoder_input_repr`.
    pub fn train(
        &self,
        encoder_input_repr: &str,
        decoder_input_repr: Option<&str>,
        config: AlignConfig,
    ) -> Result<AlignmentModel> {
        self.validate(encoder_input_repr, decoder_input_repr, &config)?;
        let registry = self.registry;

        let condition_names: Vec<String> = registry
            .conditions()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let stats: Option<Vec<ColumnStats>> = if config.standardize {
            Some(
                condition_names
                    .iter()
                    .map(|name| {
                        Ok(ColumnStats::from_matrix(
                            registry.representation(name, encoder_input_repr)?,
                        ))
                    })
                    .collect::<Result<_>>()?,
            )
        } else {
            None
        };

        let mut inputs = Vec::with_capacity(condition_names.len());
        for (ci, name) in condition_names.iter().enumerate() {
            let m = registry.representation(name, encoder_input_repr)?;
            let t = match &stats {
                Some(stats) => stats[ci].apply(m, &self.device)?,
                None => m.to_tensor(&self.device)?,
            };
            inputs.push(t);
        }
        let in_dim = inputs[0].dims2()?.1;

        let targets: Option<Vec<Tensor>> = match decoder_input_repr {
            Some(repr) => Some(
                condition_names
                    .iter()
                    .map(|name| registry.representation(name, repr)?.to_tensor(&self.device))
                    .collect::<Result<_>>()?,
            ),
            None => None,
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let encoder = EncoderNet::load(vb.pp("encoder"), in_dim, config.latent_dim, config.depth)?;
        let decoders: Option<Vec<DecoderNet>> = match &targets {
            Some(targets) => {
                let mut nets = Vec::with_capacity(condition_names.len());
                for (ci, name) in condition_names.iter().enumerate() {
                    let out_dim = targets[ci].dims2()?.1;
                    nets.push(DecoderNet::load(
                        vb.pp(format!("decoder/{name}")),
                        config.latent_dim,
                        out_dim,
                        config.depth,
                    )?);
                }
                Some(nets)
            }
            None => None,
        };
        seed_vars(&varmap, config.seed)?;

        let mut opt = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;
        let loss_fn = AlignmentLoss::new(config.lambda_align, config.lambda_recon);

        let mut losses: Vec<LossComponents> = Vec::with_capacity(config.steps);
        let mut early_stopped = false;
        let mut plateaued = false;

        for step in 1..=config.steps {
            let latents: Vec<Tensor> = inputs
                .iter()
                .map(|x| encoder.forward(x))
                .collect::<candle_core::Result<_>>()?;

            let mut recons = Vec::new();
            if let (Some(decoders), Some(targets)) = (&decoders, &targets) {
                for (ci, decoder) in decoders.iter().enumerate() {
                    recons.push((decoder.forward(&latents[ci])?, targets[ci].clone()));
                }
            }

            let (total, components) = loss_fn.compute(&latents, &recons)?;
            opt.backward_step(&total)?;
            losses.push(components);

            if config.log_every > 0 && step % config.log_every == 0 {
                info!(
                    step,
                    total = components.total,
                    align = components.align,
                    recon = components.recon,
                    "training step"
                );
            }

            if config.plateau_window > 0 && losses.len() >= 2 * config.plateau_window {
                let flat = window_is_flat(&losses, config.plateau_window, config.plateau_tol);
                if flat && !plateaued {
                    warn!(step, "loss failed to decrease over the trailing window");
                }
                plateaued = flat;
                if flat && config.early_stopping {
                    early_stopped = true;
                    break;
                }
            }
        }

        let history = TrainingHistory {
            steps_run: losses.len(),
            losses,
            early_stopped,
            convergence: if plateaued {
                Convergence::Plateau
            } else {
                Convergence::Decreasing
            },
        };

        Ok(AlignmentModel {
            encoder,
            decoders,
            stats,
            condition_names,
            encoder_repr: encoder_input_repr.to_string(),
            decoder_repr: decoder_input_repr.map(str::to_string),
            history,
            device: self.device.clone(),
        })
    }

    fn validate(
        &self,
        encoder_input_repr: &str,
        decoder_input_repr: Option<&str>,
        config: &AlignConfig,
    ) -> Result<()> {
        let registry = self.registry;
        if registry.n_conditions() < 2 {
            return Err(AlignError::Config(
                "alignment needs at least two registered conditions".to_string(),
            ));
        }
        if config.steps == 0 {
            return Err(AlignError::Config("steps must be positive".to_string()));
        }
        if config.latent_dim == 0 {
            return Err(AlignError::Config("latent_dim must be positive".to_string()));
        }
        if !registry.has_representation(encoder_input_repr) {
            return Err(AlignError::Config(format!(
                "encoder input representation {encoder_input_repr:?} is not present for every condition"
            )));
        }
        let widths: Vec<usize> = registry
            .conditions()
            .iter()
            .map(|c| {
                c.representation(encoder_input_repr)
                    .map(Matrix::cols)
                    .unwrap_or(0)
            })
            .collect();
        if widths.windows(2).any(|w| w[0] != w[1]) {
            return Err(AlignError::Config(format!(
                "encoder input representation {encoder_input_repr:?} has differing widths across conditions"
            )));
        }
        match (config.decode, decoder_input_repr) {
            (true, None) => {
                return Err(AlignError::Config(
                    "decode is enabled but no decoder input representation was given".to_string(),
                ))
            }
            (false, Some(_)) => {
                return Err(AlignError::Config(
                    "a decoder input representation was given but decode is disabled".to_string(),
                ))
            }
            (true, Some(repr)) => {
                if !registry.has_representation(repr) {
                    return Err(AlignError::Config(format!(
                        "decoder input representation {repr:?} is not present for every condition"
                    )));
                }
            }
            (false, None) => {}
        }
        Ok(())
    }
}

/// A trained alignment. Immutable: re-training produces a new model.
#[derive(Debug)]
pub struct AlignmentModel {
    encoder: EncoderNet,
    decoders: Option<Vec<DecoderNet>>,
    stats: Option<Vec<ColumnStats>>,
    condition_names: Vec<String>,
    encoder_repr: String,
    decoder_repr: Option<String>,
    history: TrainingHistory,
    device: Device,
}

impl AlignmentModel {
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn encoder_repr(&self) -> &str {
        &self.encoder_repr
    }

    pub fn decoding_enabled(&self) -> bool {
        self.decoders.is_some()
    }

    /// Encode every condition in canonical order into the shared latent
    /// space.
    pub fn embed(&self, registry: &DatasetRegistry) -> Result<EmbeddingResult> {
        self.check_registry(registry)?;
        let mut parts = Vec::with_capacity(self.condition_names.len());
        for ci in 0..self.condition_names.len() {
            let z = self.encode_condition(registry, ci)?;
            parts.push(Matrix::from_tensor(&z)?);
        }
        let refs: Vec<&Matrix> = parts.iter().collect();
        Ok(EmbeddingResult {
            order: registry.combined_order().to_vec(),
            latent: Matrix::vstack(&refs)?,
        })
    }

    /// Project `source` cells into `target`'s native feature space by
    /// encoding them and applying `target`'s decoder.
    pub fn project(
        &self,
        registry: &DatasetRegistry,
        source: &str,
        target: &str,
    ) -> Result<ProjectionResult> {
        self.check_registry(registry)?;
        let decoders = self.decoders.as_ref().ok_or_else(|| {
            AlignError::Config("model was trained without decoding".to_string())
        })?;
        if source == target {
            return Err(AlignError::Config(
                "projection source and target must differ".to_string(),
            ));
        }
        let source_idx = self.condition_index(source)?;
        let target_idx = self.condition_index(target)?;

        let z = self.encode_condition(registry, source_idx)?;
        let decoded = decoders[target_idx].forward(&z)?;
        Ok(ProjectionResult {
            source: source.to_string(),
            target: target.to_string(),
            cell_ids: registry.condition(source)?.cell_ids().to_vec(),
            values: Matrix::from_tensor(&decoded)?,
            native_repr: self
                .decoder_repr
                .clone()
                .expect("decoder_repr present when decoders are"),
        })
    }

    /// Write every artifact this model produces under `run_tag`: the shared
    /// embedding, and one directed projection per ordered condition pair when
    /// decoding was enabled. Returns the tags written.
    pub fn publish(
        &self,
        registry: &DatasetRegistry,
        store: &mut EmbeddingStore,
        run_tag: &str,
    ) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        store.insert(run_tag, Artifact::Embedding(self.embed(registry)?))?;
        tags.push(run_tag.to_string());

        if self.decoders.is_some() {
            for source in &self.condition_names {
                for target in &self.condition_names {
                    if source == target {
                        continue;
                    }
                    let tag = projection_tag(run_tag, source, target);
                    store.insert(
                        &tag,
                        Artifact::Projection(self.project(registry, source, target)?),
                    )?;
                    tags.push(tag);
                }
            }
        }
        Ok(tags)
    }

    fn encode_condition(&self, registry: &DatasetRegistry, ci: usize) -> Result<Tensor> {
        let name = &self.condition_names[ci];
        let m = registry.representation(name, &self.encoder_repr)?;
        let x = match &self.stats {
            Some(stats) => stats[ci].apply(m, &self.device)?,
            None => m.to_tensor(&self.device)?,
        };
        Ok(self.encoder.forward(&x)?)
    }

    fn condition_index(&self, name: &str) -> Result<usize> {
        self.condition_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| AlignError::UnknownCondition(name.to_string()))
    }

    fn check_registry(&self, registry: &DatasetRegistry) -> Result<()> {
        let names: Vec<&str> = registry.conditions().iter().map(|c| c.name()).collect();
        let ours: Vec<&str> = self.condition_names.iter().map(String::as_str).collect();
        if names != ours {
            return Err(AlignError::Schema(
                "registry conditions do not match the ones this model was trained on".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deterministic parameter init: gaussian weights scaled by 1/sqrt(fan_in),
/// zero biases, drawn from one seeded stream over name-sorted variables.
fn seed_vars(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap.data().lock().expect("varmap lock");
    let mut names: Vec<String> = data.keys().cloned().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in &names {
        let var = &data[name];
        let dims = var.as_tensor().dims().to_vec();
        let device = var.as_tensor().device().clone();
        let fresh = if dims.len() == 2 {
            let std = (1.0 / dims[1] as f32).sqrt();
            let vals: Vec<f32> = (0..dims[0] * dims[1])
                .map(|_| {
                    let g: f32 = StandardNormal.sample(&mut rng);
                    g * std
                })
                .collect();
            Tensor::from_slice(&vals, (dims[0], dims[1]), &device)?
        } else {
            Tensor::zeros(var.as_tensor().shape(), DType::F32, &device)?
        };
        var.set(&fresh)?;
    }
    Ok(())
}

fn window_is_flat(losses: &[LossComponents], window: usize, tol: f32) -> bool {
    let n = losses.len();
    let recent: f32 =
        losses[n - window..].iter().map(|l| l.total).sum::<f32>() / window as f32;
    let previous: f32 = losses[n - 2 * window..n - window]
        .iter()
        .map(|l| l.total)
        .sum::<f32>()
        / window as f32;
    recent > previous - tol * previous.abs()
}
