use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::frame::Frame;
use crate::model::{ModelConfig, PolicyValueNet};
use crate::rollout::Transition;

// =============================================================================
// Agent Hyperparameters
// =============================================================================

#[derive(Clone, Debug)]
pub struct PpoConfig {
    pub model: ModelConfig,
    /// Half-width of the trust band for both the probability ratio and the
    /// value update.
    pub clip_epsilon: f64,
    pub value_coef: f64,
    /// Signed: positive rewards entropy, negative penalizes it.
    pub entropy_coef: f64,
    pub gamma: f32,
    pub lam: f32,
    pub lr: f64,
    pub weight_decay: f64,
    /// Full passes over each collected segment.
    pub optimizer_epochs: usize,
    pub minibatch_size: usize,
    pub num_minibatches: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            clip_epsilon: 0.1,
            value_coef: 1.0,
            entropy_coef: 0.01,
            gamma: 0.99,
            lam: 0.95,
            lr: 1e-4,
            weight_decay: 0.0,
            optimizer_epochs: 4,
            minibatch_size: 32,
            num_minibatches: 32,
        }
    }
}

impl PpoConfig {
    /// Transitions collected per iteration.
    pub fn segment_size(&self) -> usize {
        self.minibatch_size * self.num_minibatches
    }
}

/// Scalar loss terms of one minibatch, for logging and the NaN guard.
/// `policy`, `value` and `entropy` are unweighted; `total` carries the
/// coefficients.
#[derive(Clone, Copy, Debug)]
pub struct Losses {
    pub total: f32,
    pub policy: f32,
    pub value: f32,
    pub entropy: f32,
}

// =============================================================================
// Minibatches
// =============================================================================

/// One optimizer batch, assembled on the training device. Old log-probs and
/// values are copied out of the transitions, so they stay fixed while the
/// parameters move.
pub struct Minibatch {
    /// Byte observations, `[b, c, h, w]`.
    pub states: Tensor,
    /// Sampled gates as 0/1 floats, `[b, actions]`.
    pub gates: Tensor,
    /// Sampling-time per-gate log-probabilities, `[b, actions]`.
    pub log_probs: Tensor,
    /// Sampling-time value estimates, `[b]`.
    pub values: Tensor,
    /// Normalized advantages, `[b]`.
    pub advantages: Tensor,
}

impl Minibatch {
    /// Gathers the transitions selected by `indices` out of a segment.
    /// `advantages` is index-aligned with `segment`.
    pub fn from_transitions(
        net: &PolicyValueNet,
        segment: &[Transition],
        advantages: &[f32],
        indices: &[usize],
    ) -> Result<Self> {
        debug_assert_eq!(segment.len(), advantages.len());
        let device = net.device();
        let n = net.num_actions();
        let states: Vec<&Frame> = indices.iter().map(|&i| &segment[i].state).collect();
        let states = net.batch_tensor(&states)?;

        let mut gates = Vec::with_capacity(indices.len() * n);
        let mut log_probs = Vec::with_capacity(indices.len() * n);
        let mut values = Vec::with_capacity(indices.len());
        let mut advs = Vec::with_capacity(indices.len());
        for &i in indices {
            let t = &segment[i];
            gates.extend(t.gates.iter().map(|&g| if g { 1.0f32 } else { 0.0 }));
            log_probs.extend_from_slice(&t.log_probs);
            values.push(t.value);
            advs.push(advantages[i]);
        }
        Ok(Self {
            states,
            gates: Tensor::from_vec(gates, (indices.len(), n), device)?,
            log_probs: Tensor::from_vec(log_probs, (indices.len(), n), device)?,
            values: Tensor::from_vec(values, indices.len(), device)?,
            advantages: Tensor::from_vec(advs, indices.len(), device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.values.dims1().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Checkpointing
// =============================================================================

#[derive(Serialize, Deserialize)]
struct OptimizerState {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl From<&ParamsAdamW> for OptimizerState {
    fn from(params: &ParamsAdamW) -> Self {
        Self {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TrainMeta {
    pub best_avg_reward: f64,
    pub iterations: u64,
    pub total_steps: u64,
    pub episodes: u64,
}

pub fn save_checkpoint<P: AsRef<Path>>(agent: &PpoAgent, meta: &TrainMeta, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    agent.varmap.save(dir.join("model.safetensors"))?;
    agent.save_optimizer(dir.join("optimizer.json"))?;

    let file = File::create(dir.join("meta.json"))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, meta)?;
    Ok(())
}

pub fn save_recent_rewards<P: AsRef<Path>>(recent_rewards: &[f64], dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let file = File::create(dir.join("recent_rewards.json"))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, recent_rewards)?;
    Ok(())
}

pub fn load_recent_rewards<P: AsRef<Path>>(dir: P) -> Result<Option<Vec<f64>>> {
    let path = dir.as_ref().join("recent_rewards.json");
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path)?;
    let reader = std::io::BufReader::new(file);
    Ok(Some(serde_json::from_reader(reader)?))
}

// =============================================================================
// PPO Agent
// =============================================================================

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

/// Elementwise `min(a, b)`; gradients follow the chosen side.
fn elementwise_min(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(a.lt(b)?.where_cond(a, b)?)
}

/// Elementwise `max(a, b)`; gradients follow the chosen side.
fn elementwise_max(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(a.gt(b)?.where_cond(a, b)?)
}

/// Clamps every element into `[lo, hi]`. Gradients flow only through
/// elements already inside the band.
fn clip_to_band(x: &Tensor, lo: f64, hi: f64) -> Result<Tensor> {
    let floor = x.ones_like()?.affine(0.0, lo)?;
    let ceil = x.ones_like()?.affine(0.0, hi)?;
    let raised = elementwise_max(x, &floor)?;
    elementwise_min(&raised, &ceil)
}

pub struct PpoAgent {
    pub varmap: VarMap,
    net: PolicyValueNet,
    optimizer: AdamW,
    pub config: PpoConfig,
    /// Optimizer steps abandoned because the loss went non-finite.
    pub skipped_steps: u64,
}

impl PpoAgent {
    pub fn new(
        device: &Device,
        obs_shape: (usize, usize, usize),
        num_actions: usize,
        config: PpoConfig,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = PolicyValueNet::new(vs, obs_shape, num_actions, &config.model)?;

        let opt_params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), opt_params)?;

        Ok(Self {
            varmap,
            net,
            optimizer,
            config,
            skipped_steps: 0,
        })
    }

    pub fn net(&self) -> &PolicyValueNet {
        &self.net
    }

    /// Clipped-surrogate objective over one minibatch. Returns the
    /// graph-bearing total plus the detached scalar breakdown.
    fn compute_losses(&self, batch: &Minibatch) -> Result<(Tensor, Losses)> {
        let eps = self.config.clip_epsilon;
        let (log_probs, entropy, values) = self.net.evaluate(&batch.states, &batch.gates)?;

        // Per-gate probability ratio against the sampling-time policy.
        let ratio = log_probs.sub(&batch.log_probs)?.exp()?;
        let advantages = batch.advantages.unsqueeze(1)?;
        let surrogate = ratio.broadcast_mul(&advantages)?;
        let clipped = clip_to_band(&ratio, 1.0 - eps, 1.0 + eps)?.broadcast_mul(&advantages)?;
        let policy_loss = elementwise_min(&surrogate, &clipped)?.mean_all()?.neg()?;

        // Value regression against estimated returns, pessimistic between
        // the raw error and the error of a band-limited value update.
        let returns = batch.advantages.add(&batch.values)?;
        let error = values.sub(&returns)?.sqr()?;
        let shift = values.sub(&batch.values)?;
        let clamped_values = batch.values.add(&clip_to_band(&shift, -eps, eps)?)?;
        let clamped_error = clamped_values.sub(&returns)?.sqr()?;
        let value_loss = elementwise_max(&error, &clamped_error)?
            .mean_all()?
            .affine(0.5, 0.0)?;

        let entropy_mean = entropy.mean_all()?;
        let total = policy_loss
            .add(&value_loss.affine(self.config.value_coef, 0.0)?)?
            .sub(&entropy_mean.affine(self.config.entropy_coef, 0.0)?)?;

        let losses = Losses {
            total: total.to_scalar::<f32>()?,
            policy: policy_loss.to_scalar::<f32>()?,
            value: value_loss.to_scalar::<f32>()?,
            entropy: entropy_mean.to_scalar::<f32>()?,
        };
        Ok((total, losses))
    }

    /// Loss breakdown without touching the parameters.
    pub fn losses(&self, batch: &Minibatch) -> Result<Losses> {
        Ok(self.compute_losses(batch)?.1)
    }

    /// One optimizer update. A non-finite total loss leaves the parameters
    /// untouched and only bumps `skipped_steps`.
    pub fn optimize_step(&mut self, batch: &Minibatch) -> Result<Losses> {
        with_autorelease_pool(|| {
            let (total, losses) = self.compute_losses(batch)?;
            if !losses.total.is_finite() {
                self.skipped_steps += 1;
                eprintln!(
                    "⚠️  Non-finite loss (policy {:.4}, value {:.4}, entropy {:.4}); skipping optimizer step",
                    losses.policy, losses.value, losses.entropy
                );
                return Ok(losses);
            }
            let grads = total.backward()?;
            self.optimizer.step(&grads)?;
            Ok(losses)
        })
    }

    /// Save model weights
    pub fn save(&self, path: &str) -> Result<()> {
        self.varmap.save(path)?;
        eprintln!("💾 Model saved to {path}");
        Ok(())
    }

    /// Load model weights
    pub fn load(&mut self, path: &str) -> Result<()> {
        self.varmap.load(path)?;
        eprintln!("📂 Model loaded from {path}");
        Ok(())
    }

    pub fn save_optimizer<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = OptimizerState::from(self.optimizer.params());
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &state)?;
        Ok(())
    }

    pub fn load_optimizer<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let state: OptimizerState =
            serde_json::from_reader(reader).context("Failed to parse optimizer state")?;
        let params = ParamsAdamW {
            lr: state.lr,
            beta1: state.beta1,
            beta2: state.beta2,
            eps: state.eps,
            weight_decay: state.weight_decay,
        };
        self.optimizer.set_params(params);
        Ok(())
    }

    pub fn resume_from(&mut self, resume_dir: &Path) -> Result<TrainMeta> {
        let model_path = resume_dir.join("model.safetensors");
        let optimizer_path = resume_dir.join("optimizer.json");
        let meta_path = resume_dir.join("meta.json");

        self.varmap.load(&model_path)?;
        if let Err(err) = self.load_optimizer(&optimizer_path) {
            eprintln!(
                "⚠️  Optimizer state load failed ({err}). Continuing with fresh optimizer state."
            );
        }
        let file = File::open(&meta_path)?;
        let reader = std::io::BufReader::new(file);
        let meta: TrainMeta = serde_json::from_reader(reader)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model_config;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn test_agent(num_actions: usize) -> PpoAgent {
        let config = PpoConfig {
            model: test_model_config(),
            ..Default::default()
        };
        PpoAgent::new(&Device::Cpu, (16, 16, 2), num_actions, config).unwrap()
    }

    /// Batch whose transitions were sampled from `net` itself, so the fresh
    /// ratio is exactly 1.
    fn test_batch(net: &PolicyValueNet, advantages: &[f32]) -> Minibatch {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut segment = Vec::new();
        for i in 0..advantages.len() {
            let frame = Frame::new(16, 16, 2, vec![(i * 40) as u8; 16 * 16 * 2]).unwrap();
            let (gates, log_probs, value) = net.select_action(&frame, &mut rng).unwrap();
            segment.push(Transition {
                raw: Arc::new(frame.clone()),
                state: frame.clone(),
                gates,
                log_probs,
                value,
                reward: 1.0,
                done: false,
                next_raw: Arc::new(frame.clone()),
                next_state: frame,
            });
        }
        let indices: Vec<usize> = (0..advantages.len()).collect();
        Minibatch::from_transitions(net, &segment, advantages, &indices).unwrap()
    }

    #[test]
    fn band_clipping_saturates_outside_the_band() {
        let x = Tensor::from_vec(vec![0.5f32, 0.95, 1.0, 1.05, 1.5], 5, &Device::Cpu).unwrap();
        let clipped = clip_to_band(&x, 0.9, 1.1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(clipped, [0.9, 0.95, 1.0, 1.05, 1.1]);
    }

    #[test]
    fn elementwise_selection_is_per_element() {
        let a = Tensor::from_vec(vec![1.0f32, 4.0], 2, &Device::Cpu).unwrap();
        let b = Tensor::from_vec(vec![3.0f32, 2.0], 2, &Device::Cpu).unwrap();
        let min = elementwise_min(&a, &b).unwrap().to_vec1::<f32>().unwrap();
        let max = elementwise_max(&a, &b).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(min, [1.0, 2.0]);
        assert_eq!(max, [3.0, 4.0]);
    }

    #[test]
    fn fresh_policy_losses_reduce_to_their_closed_forms() {
        let agent = test_agent(4);
        let advantages = [1.0f32, -0.5, 0.25, 0.0];
        let batch = test_batch(agent.net(), &advantages);
        let losses = agent.losses(&batch).unwrap();

        // Unchanged parameters mean ratio = 1, so the policy term is the
        // negated mean advantage (broadcast across all four gates).
        let mean_adv: f32 = advantages.iter().sum::<f32>() / advantages.len() as f32;
        assert!(
            (losses.policy + mean_adv).abs() < 1e-4,
            "policy {} vs negated mean advantage {}",
            losses.policy,
            -mean_adv
        );

        // Likewise V_new = V_old, so the value term is 0.5 · mean(A²).
        let mean_sq: f32 =
            advantages.iter().map(|a| a * a).sum::<f32>() / advantages.len() as f32;
        assert!(
            (losses.value - 0.5 * mean_sq).abs() < 1e-4,
            "value {} vs {}",
            losses.value,
            0.5 * mean_sq
        );

        let expected = losses.policy + agent.config.value_coef as f32 * losses.value
            - agent.config.entropy_coef as f32 * losses.entropy;
        assert!((losses.total - expected).abs() < 1e-5);
        assert!(losses.entropy > 0.0);
    }

    #[test]
    fn clipping_bounds_the_surrogate_for_extreme_ratios() {
        let agent = test_agent(3);
        let base = test_batch(agent.net(), &[1.0, 1.0, 1.0]);
        let eps = agent.config.clip_epsilon as f32;

        // Shifting the stored log-probs down by ln(r) makes every fresh
        // per-gate ratio exactly r. With unit advantages the clipped branch
        // wins and pins the policy term to the band edge, however large r.
        let mut policies = Vec::new();
        for ratio in [10.0f64, 1000.0] {
            let batch = Minibatch {
                states: base.states.clone(),
                gates: base.gates.clone(),
                log_probs: base.log_probs.affine(1.0, -ratio.ln()).unwrap(),
                values: base.values.clone(),
                advantages: base.advantages.clone(),
            };
            let losses = agent.losses(&batch).unwrap();
            assert!(
                (losses.policy + (1.0 + eps)).abs() < 1e-4,
                "ratio {ratio}: policy loss {} should sit at {}",
                losses.policy,
                -(1.0 + eps)
            );
            policies.push(losses.policy);
        }
        assert!((policies[0] - policies[1]).abs() < 1e-5);
    }

    #[test]
    fn entropy_coefficient_sign_mirrors_its_contribution() {
        let mut agent = test_agent(4);
        let batch = test_batch(agent.net(), &[0.5, -0.5, 1.0, 0.0]);

        agent.config.entropy_coef = 0.01;
        let bonus = agent.losses(&batch).unwrap();
        agent.config.entropy_coef = -0.01;
        let penalty = agent.losses(&batch).unwrap();

        assert!((bonus.entropy - penalty.entropy).abs() < 1e-6);
        let gap = penalty.total - bonus.total;
        assert!(
            (gap - 2.0 * 0.01 * bonus.entropy).abs() < 1e-4,
            "flipping the sign should swing the total by 2·coef·entropy, got {gap}"
        );
    }

    #[test]
    fn non_finite_loss_skips_the_optimizer_step() {
        let mut agent = test_agent(4);
        let probe = Frame::new(16, 16, 2, vec![7u8; 16 * 16 * 2]).unwrap();
        let before = agent.net().value(&probe).unwrap();

        let batch = test_batch(agent.net(), &[f32::NAN, 1.0, 1.0, 1.0]);
        let losses = agent.optimize_step(&batch).unwrap();

        assert!(!losses.total.is_finite());
        assert_eq!(agent.skipped_steps, 1);
        let after = agent.net().value(&probe).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn checkpoint_round_trips_weights_and_meta() {
        let dir = std::env::temp_dir().join(format!("nes-ppo-ckpt-{}", std::process::id()));
        let config = PpoConfig {
            model: test_model_config(),
            ..Default::default()
        };
        let agent = PpoAgent::new(&Device::Cpu, (16, 16, 2), 4, config.clone()).unwrap();
        let meta = TrainMeta {
            best_avg_reward: 1.5,
            iterations: 3,
            total_steps: 4096,
            episodes: 17,
        };
        save_checkpoint(&agent, &meta, &dir).unwrap();
        save_recent_rewards(&[1.0, 2.0], &dir).unwrap();

        let mut fresh = PpoAgent::new(&Device::Cpu, (16, 16, 2), 4, config).unwrap();
        let restored = fresh.resume_from(&dir).unwrap();
        assert_eq!(restored.iterations, 3);
        assert_eq!(restored.total_steps, 4096);
        assert_eq!(restored.episodes, 17);

        let probe = Frame::new(16, 16, 2, vec![9u8; 16 * 16 * 2]).unwrap();
        let original = agent.net().value(&probe).unwrap();
        let reloaded = fresh.net().value(&probe).unwrap();
        assert!((original - reloaded).abs() < 1e-6);

        assert_eq!(load_recent_rewards(&dir).unwrap(), Some(vec![1.0, 2.0]));
        std::fs::remove_dir_all(&dir).ok();
    }
}
