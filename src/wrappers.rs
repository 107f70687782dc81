use std::collections::VecDeque;

use anyhow::Result;

use crate::env::{Environment, Obs, Step};
use crate::frame::{Frame, PreprocessingError};

// =============================================================================
// Pipeline Knobs
// =============================================================================

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Native frames advanced per agent step; rewards are summed across them.
    pub skip: usize,
    /// Pixel-wise max over the most recent N frames of each skip burst.
    /// 1 keeps the last frame as-is; 2 suppresses sprite flicker.
    pub max_pool: usize,
    /// Buttons held during the repeated frames of a burst. `None` repeats
    /// the chosen action.
    pub pad_action: Option<Vec<bool>>,
    pub reward_scale: f64,
    /// Collapse rewards to sign(reward).
    pub clip_rewards: bool,
    pub warp_height: usize,
    pub warp_width: usize,
    pub keep_color: bool,
    /// Processed frames stacked along the channel axis per observation.
    pub stack: usize,
    /// Subtracted from every reward the agent sees.
    pub time_penalty: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip: 4,
            max_pool: 1,
            pad_action: None,
            reward_scale: 0.01,
            clip_rewards: false,
            warp_height: 80,
            warp_width: 80,
            keep_color: false,
            stack: 4,
            time_penalty: 0.0,
        }
    }
}

/// Wraps an environment in the full preprocessing chain. Stages own their
/// inner stage outright and delegate through it; reading outside-in the
/// order is time penalty, stack, warp, reward shaping, frame skip.
pub fn wrap<E: Environment>(env: E, config: PipelineConfig) -> impl Environment {
    let env = SkipFrames::new(env, config.skip, config.max_pool, config.pad_action);
    let env = RewardScaler::new(env, config.reward_scale);
    let env = RewardClipper::new(env, config.clip_rewards);
    let env = WarpFrame::new(env, config.warp_height, config.warp_width, config.keep_color);
    let env = FrameStack::new(env, config.stack);
    TimePenalty::new(env, config.time_penalty)
}

// =============================================================================
// Frame Skip
// =============================================================================

pub struct SkipFrames<E> {
    env: E,
    skip: usize,
    max_pool: usize,
    pad_action: Option<Vec<bool>>,
}

impl<E: Environment> SkipFrames<E> {
    pub fn new(env: E, skip: usize, max_pool: usize, pad_action: Option<Vec<bool>>) -> Self {
        Self {
            env,
            skip: skip.max(1),
            max_pool: max_pool.max(1),
            pad_action,
        }
    }
}

impl<E: Environment> Environment for SkipFrames<E> {
    fn reset(&mut self) -> Result<Obs> {
        self.env.reset()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        let mut total_reward = step.reward;
        let mut recent = Vec::new();
        if self.max_pool > 1 {
            recent.push(step.obs.frame.clone());
        }
        for _ in 1..self.skip {
            if step.done {
                break;
            }
            let held = self.pad_action.as_deref().unwrap_or(action);
            step = self.env.step(held)?;
            total_reward += step.reward;
            if self.max_pool > 1 {
                if recent.len() == self.max_pool {
                    recent.remove(0);
                }
                recent.push(step.obs.frame.clone());
            }
        }
        if self.max_pool > 1 {
            step.obs.frame = Frame::pixelwise_max(&recent)?;
        }
        step.reward = total_reward;
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        self.env.obs_shape()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}

// =============================================================================
// Reward Shaping
// =============================================================================

pub struct RewardScaler<E> {
    env: E,
    scale: f64,
}

impl<E: Environment> RewardScaler<E> {
    pub fn new(env: E, scale: f64) -> Self {
        Self { env, scale }
    }
}

impl<E: Environment> Environment for RewardScaler<E> {
    fn reset(&mut self) -> Result<Obs> {
        self.env.reset()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.reward *= self.scale;
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        self.env.obs_shape()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}

pub struct RewardClipper<E> {
    env: E,
    enabled: bool,
}

impl<E: Environment> RewardClipper<E> {
    pub fn new(env: E, enabled: bool) -> Self {
        Self { env, enabled }
    }
}

impl<E: Environment> Environment for RewardClipper<E> {
    fn reset(&mut self) -> Result<Obs> {
        self.env.reset()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        if self.enabled {
            // f64::signum(0.0) is 1.0; zero must stay zero.
            step.reward = if step.reward > 0.0 {
                1.0
            } else if step.reward < 0.0 {
                -1.0
            } else {
                0.0
            };
        }
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        self.env.obs_shape()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}

pub struct TimePenalty<E> {
    env: E,
    penalty: f64,
}

impl<E: Environment> TimePenalty<E> {
    pub fn new(env: E, penalty: f64) -> Self {
        Self { env, penalty }
    }
}

impl<E: Environment> Environment for TimePenalty<E> {
    fn reset(&mut self) -> Result<Obs> {
        self.env.reset()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.reward -= self.penalty;
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        self.env.obs_shape()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}

// =============================================================================
// Warp
// =============================================================================

pub struct WarpFrame<E> {
    env: E,
    height: usize,
    width: usize,
    keep_color: bool,
}

impl<E: Environment> WarpFrame<E> {
    pub fn new(env: E, height: usize, width: usize, keep_color: bool) -> Self {
        Self {
            env,
            height,
            width,
            keep_color,
        }
    }

    fn transform(&self, frame: Frame) -> Result<Frame, PreprocessingError> {
        let frame = if self.keep_color {
            frame
        } else {
            frame.grayscale()?
        };
        Ok(frame.resize_area(self.height, self.width))
    }
}

impl<E: Environment> Environment for WarpFrame<E> {
    fn reset(&mut self) -> Result<Obs> {
        let mut obs = self.env.reset()?;
        obs.frame = self.transform(obs.frame)?;
        Ok(obs)
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        step.obs.frame = self.transform(step.obs.frame)?;
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        let channels = if self.keep_color {
            self.env.obs_shape().2
        } else {
            1
        };
        (self.height, self.width, channels)
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}

// =============================================================================
// Frame Stack
// =============================================================================

/// Sliding window over the last `k` processed frames, concatenated eagerly
/// along the channel axis. `reset` pads the window with `k` copies of the
/// first frame so the stack is always full.
pub struct FrameStack<E> {
    env: E,
    k: usize,
    frames: VecDeque<Frame>,
}

impl<E: Environment> FrameStack<E> {
    pub fn new(env: E, k: usize) -> Self {
        let k = k.max(1);
        Self {
            env,
            k,
            frames: VecDeque::with_capacity(k),
        }
    }

    fn stacked(&self) -> Result<Frame> {
        if self.frames.len() != self.k {
            return Err(PreprocessingError::StackSize {
                expected: self.k,
                actual: self.frames.len(),
            }
            .into());
        }
        let refs: Vec<&Frame> = self.frames.iter().collect();
        Ok(Frame::concat_channels(&refs)?)
    }
}

impl<E: Environment> Environment for FrameStack<E> {
    fn reset(&mut self) -> Result<Obs> {
        let mut obs = self.env.reset()?;
        self.frames.clear();
        for _ in 0..self.k {
            self.frames.push_back(obs.frame.clone());
        }
        obs.frame = self.stacked()?;
        Ok(obs)
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let mut step = self.env.step(action)?;
        self.frames.pop_front();
        self.frames.push_back(step.obs.frame.clone());
        step.obs.frame = self.stacked()?;
        Ok(step)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        let (h, w, c) = self.env.obs_shape();
        (h, w, c * self.k)
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }
}
