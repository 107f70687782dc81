use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::frame::{Frame, PreprocessingError};

/// Smoothing added inside every log so zero-probability gates cannot produce
/// infinities. The sampling path and the batched evaluation path must use the
/// same constant or the first-epoch probability ratios drift.
const PROB_EPS: f32 = 1e-6;

// =============================================================================
// Network Hyperparameters
// =============================================================================

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub conv_channels: [usize; 3],
    pub kernels: [usize; 3],
    pub strides: [usize; 3],
    pub hidden_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conv_channels: [32, 64, 128],
            kernels: [8, 4, 3],
            strides: [2, 2, 2],
            hidden_size: 512,
        }
    }
}

// =============================================================================
// Policy-Value Network (candle)
// =============================================================================

/// Convolutional torso with two heads: per-action Bernoulli gate
/// probabilities (actions are combinable, so no softmax across them) and a
/// scalar state-value estimate.
/// Input: stacked frames as byte-valued pixels, NCHW.
#[derive(Debug)]
pub struct PolicyValueNet {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    dense: Linear,
    action_head: Linear,
    value_head: Linear,
    obs_shape: (usize, usize, usize),
    num_actions: usize,
    device: Device,
}

impl PolicyValueNet {
    /// `obs_shape` is the post-pipeline (height, width, channels) of a single
    /// stacked observation.
    pub fn new(
        vs: VarBuilder,
        obs_shape: (usize, usize, usize),
        num_actions: usize,
        config: &ModelConfig,
    ) -> Result<Self> {
        let (height, width, channels) = obs_shape;
        let mut h = height;
        let mut w = width;
        for i in 0..3 {
            let (k, s) = (config.kernels[i], config.strides[i]);
            ensure!(
                h >= k && w >= k,
                "observation {}x{} is too small for the conv stack",
                height,
                width
            );
            h = (h - k) / s + 1;
            w = (w - k) / s + 1;
        }
        let [c1, c2, c3] = config.conv_channels;
        let conv_cfg = |stride| Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(
            channels,
            c1,
            config.kernels[0],
            conv_cfg(config.strides[0]),
            vs.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            c1,
            c2,
            config.kernels[1],
            conv_cfg(config.strides[1]),
            vs.pp("conv2"),
        )?;
        let conv3 = candle_nn::conv2d(
            c2,
            c3,
            config.kernels[2],
            conv_cfg(config.strides[2]),
            vs.pp("conv3"),
        )?;
        let dense = candle_nn::linear(c3 * h * w, config.hidden_size, vs.pp("dense"))?;
        let action_head = candle_nn::linear(config.hidden_size, num_actions, vs.pp("actions"))?;
        let value_head = candle_nn::linear(config.hidden_size, 1, vs.pp("value"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            dense,
            action_head,
            value_head,
            obs_shape,
            num_actions,
            device: vs.device().clone(),
        })
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward pass over a byte-valued NCHW batch.
    /// Returns gate probabilities `[batch, actions]` and values `[batch]`.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let xs = xs.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?;
        let h = self.conv1.forward(&xs)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = self.conv3.forward(&h)?.relu()?;
        let h = h.flatten_from(1)?;
        let h = self.dense.forward(&h)?.relu()?;
        let probs = candle_nn::ops::sigmoid(&self.action_head.forward(&h)?)?;
        let values = self.value_head.forward(&h)?.squeeze(D::Minus1)?;
        Ok((probs, values))
    }

    /// Converts one stacked observation into a `[1, c, h, w]` byte tensor,
    /// rejecting frames whose shape disagrees with the network.
    pub fn obs_tensor(&self, frame: &Frame) -> Result<Tensor> {
        if frame.shape() != self.obs_shape {
            return Err(PreprocessingError::ShapeMismatch {
                expected: self.obs_shape,
                actual: frame.shape(),
            }
            .into());
        }
        let (h, w, c) = frame.shape();
        let t = Tensor::from_slice(&frame.data, (h, w, c), &self.device)?
            .permute((2, 0, 1))?
            .contiguous()?
            .unsqueeze(0)?;
        Ok(t)
    }

    /// Converts a batch of stacked observations into `[b, c, h, w]` bytes.
    pub fn batch_tensor(&self, frames: &[&Frame]) -> Result<Tensor> {
        let (h, w, c) = self.obs_shape;
        let mut data = Vec::with_capacity(frames.len() * h * w * c);
        for frame in frames {
            if frame.shape() != self.obs_shape {
                return Err(PreprocessingError::ShapeMismatch {
                    expected: self.obs_shape,
                    actual: frame.shape(),
                }
                .into());
            }
            data.extend_from_slice(&frame.data);
        }
        let t = Tensor::from_vec(data, (frames.len(), h, w, c), &self.device)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        Ok(t)
    }

    /// Samples every gate independently. Returns the gate vector, the
    /// per-gate log-probabilities of what was sampled, and the state value.
    pub fn select_action(
        &self,
        frame: &Frame,
        rng: &mut SmallRng,
    ) -> Result<(Vec<bool>, Vec<f32>, f32)> {
        let (probs, values) = self.forward(&self.obs_tensor(frame)?)?;
        let probs = probs.squeeze(0)?.to_vec1::<f32>()?;
        let value = values.squeeze(0)?.to_scalar::<f32>()?;
        let mut gates = Vec::with_capacity(probs.len());
        let mut log_probs = Vec::with_capacity(probs.len());
        for &p in &probs {
            let fired = rng.random::<f32>() < p;
            gates.push(fired);
            log_probs.push(if fired {
                (p + PROB_EPS).ln()
            } else {
                (1.0 - p + PROB_EPS).ln()
            });
        }
        Ok((gates, log_probs, value))
    }

    pub fn value(&self, frame: &Frame) -> Result<f32> {
        let (_, values) = self.forward(&self.obs_tensor(frame)?)?;
        Ok(values.squeeze(0)?.to_scalar::<f32>()?)
    }

    /// Re-evaluates previously sampled actions under the current parameters.
    /// `states` is a byte-valued NCHW batch, `actions` a 0/1 float batch of
    /// shape `[b, actions]`. Returns per-gate log-probabilities `[b, actions]`,
    /// per-state entropy summed over gates `[b]`, and values `[b]`.
    pub fn evaluate(&self, states: &Tensor, actions: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (probs, values) = self.forward(states)?;
        let log_p = probs.affine(1.0, PROB_EPS as f64)?.log()?;
        let log_not_p = probs.affine(-1.0, 1.0 + PROB_EPS as f64)?.log()?;
        let not_actions = actions.affine(-1.0, 1.0)?;
        let log_probs = actions.mul(&log_p)?.add(&not_actions.mul(&log_not_p)?)?;
        let entropy = entropy_from(&probs, &log_p, &log_not_p)?;
        Ok((log_probs, entropy, values))
    }

    /// Policy entropy for a byte-valued NCHW batch, summed over gates, `[b]`.
    pub fn entropy(&self, states: &Tensor) -> Result<Tensor> {
        let (probs, _) = self.forward(states)?;
        let log_p = probs.affine(1.0, PROB_EPS as f64)?.log()?;
        let log_not_p = probs.affine(-1.0, 1.0 + PROB_EPS as f64)?.log()?;
        entropy_from(&probs, &log_p, &log_not_p)
    }
}

/// Sum of per-gate Bernoulli entropies: `-(p*ln p + (1-p)*ln(1-p))` over the
/// gate axis.
fn entropy_from(probs: &Tensor, log_p: &Tensor, log_not_p: &Tensor) -> Result<Tensor> {
    Ok(probs
        .mul(log_p)?
        .add(&probs.affine(-1.0, 1.0)?.mul(log_not_p)?)?
        .neg()?
        .sum(D::Minus1)?)
}

/// Torso small enough for unit tests while keeping the real stack of ops.
#[cfg(test)]
pub(crate) fn test_model_config() -> ModelConfig {
    ModelConfig {
        conv_channels: [4, 4, 4],
        kernels: [3, 3, 3],
        strides: [2, 1, 1],
        hidden_size: 16,
    }
}

#[cfg(test)]
pub(crate) fn test_net(obs_shape: (usize, usize, usize), num_actions: usize) -> PolicyValueNet {
    let varmap = candle_nn::VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    PolicyValueNet::new(vs, obs_shape, num_actions, &test_model_config()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_net(num_actions: usize) -> PolicyValueNet {
        test_net((16, 16, 2), num_actions)
    }

    fn obs(fill: u8) -> Frame {
        Frame::new(16, 16, 2, vec![fill; 16 * 16 * 2]).unwrap()
    }

    #[test]
    fn forward_emits_probabilities_and_scalar_values() {
        let net = tiny_net(3);
        let states = net
            .batch_tensor(&[&obs(0), &obs(128), &obs(255)])
            .unwrap();
        let (probs, values) = net.forward(&states).unwrap();
        assert_eq!(probs.dims(), &[3, 3]);
        assert_eq!(values.dims(), &[3]);
        for row in probs.to_vec2::<f32>().unwrap() {
            for p in row {
                assert!(p > 0.0 && p < 1.0, "sigmoid output out of range: {p}");
            }
        }
    }

    #[test]
    fn sampling_and_batched_evaluation_agree() {
        let net = tiny_net(4);
        let mut rng = SmallRng::seed_from_u64(7);
        let frame = obs(63);
        let (gates, log_probs, value) = net.select_action(&frame, &mut rng).unwrap();
        assert_eq!(gates.len(), 4);

        let states = net.batch_tensor(&[&frame]).unwrap();
        let action_row: Vec<f32> = gates.iter().map(|&g| if g { 1.0 } else { 0.0 }).collect();
        let actions = Tensor::from_vec(action_row, (1, 4), &Device::Cpu).unwrap();
        let (eval_logp, entropy, eval_values) = net.evaluate(&states, &actions).unwrap();

        let eval_logp = eval_logp.squeeze(0).unwrap().to_vec1::<f32>().unwrap();
        for (sampled, evaluated) in log_probs.iter().zip(&eval_logp) {
            assert!(
                (sampled - evaluated).abs() < 1e-5,
                "log-prob mismatch: {sampled} vs {evaluated}"
            );
        }
        let eval_value = eval_values.squeeze(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((value - eval_value).abs() < 1e-5);

        // Four independent Bernoulli gates cap entropy at 4·ln 2.
        let h = entropy.squeeze(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(h >= 0.0 && h <= 4.0 * std::f32::consts::LN_2 + 1e-3);
    }

    #[test]
    fn standalone_entropy_matches_evaluation() {
        let net = tiny_net(3);
        let states = net.batch_tensor(&[&obs(17), &obs(200)]).unwrap();
        let actions = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let (_, from_eval, _) = net.evaluate(&states, &actions).unwrap();
        let standalone = net.entropy(&states).unwrap();
        for (a, b) in from_eval
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .zip(standalone.to_vec1::<f32>().unwrap())
        {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn mismatched_observations_are_rejected() {
        let net = tiny_net(3);
        let wrong = Frame::zeros(8, 8, 2);
        let err = net.obs_tensor(&wrong).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PreprocessingError>(),
            Some(&PreprocessingError::ShapeMismatch {
                expected: (16, 16, 2),
                actual: (8, 8, 2)
            })
        );
    }

    #[test]
    fn construction_rejects_observations_smaller_than_the_kernels() {
        let varmap = candle_nn::VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = PolicyValueNet::new(vs, (4, 4, 1), 2, &ModelConfig::default()).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }
}
