use anyhow::Result;
use candle_core::Device;
use rand::rngs::SmallRng;
use rand::SeedableRng;

pub mod actions;
pub mod env;
pub mod eval;
pub mod frame;
pub mod gae;
pub mod games;
pub mod model;
pub mod ppo;
pub mod rollout;
pub mod train;
pub mod wrappers;

pub use actions::{ActionAdapter, ActionMap, InvalidActionError, NES_BUTTONS};
pub use env::{EnvConfig, Environment, NesEnv, Obs, Step, StepInfo};
pub use eval::{run_baseline, run_eval, EvalStats};
pub use frame::{Frame, PreprocessingError};
pub use games::GameConfig;
pub use model::{ModelConfig, PolicyValueNet};
pub use ppo::{Losses, PpoAgent, PpoConfig, TrainMeta};
pub use rollout::{RolloutGenerator, Transition};
pub use train::{TrainConfig, Trainer};
pub use wrappers::{wrap, PipelineConfig};

/// Device plus optional seed, threaded through every constructor that needs
/// randomness.
pub struct RunContext {
    pub device: Device,
    pub seed: Option<u64>,
}

impl RunContext {
    /// Seeds the device RNG up front when a seed is given, so parameter
    /// initialization is reproducible too.
    pub fn new(device: Device, seed: Option<u64>) -> Result<Self> {
        if let Some(seed) = seed {
            device.set_seed(seed)?;
        }
        Ok(Self { device, seed })
    }

    /// Per-component RNG. Each consumer (environment noise, action
    /// sampling, minibatch shuffling, evaluation) draws its own stream so
    /// adding one never perturbs the others.
    pub fn rng(&self, stream: u64) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(stream)),
            None => SmallRng::from_os_rng(),
        }
    }
}
