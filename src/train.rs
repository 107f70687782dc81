use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::env::Environment;
use crate::gae::{estimate_advantages, normalize_advantages};
use crate::ppo::{
    load_recent_rewards, save_checkpoint, save_recent_rewards, Losses, Minibatch, PpoAgent,
    TrainMeta,
};
use crate::rollout::{EpisodeStats, RolloutGenerator, Transition};
use crate::RunContext;

// =============================================================================
// Training Configuration
// =============================================================================

#[derive(Clone, Debug)]
pub struct TrainConfig {
    /// Environment steps before training stops.
    pub max_steps: u64,
    /// Episodes longer than this are cut off and the environment reset.
    pub episode_cap: Option<u64>,
    /// Iterations between periodic checkpoints. A final checkpoint is always
    /// written.
    pub checkpoint_every: u64,
    pub checkpoint_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_steps: 50_000_000,
            episode_cap: Some(10_000),
            checkpoint_every: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

// =============================================================================
// Training Orchestrator
// =============================================================================

/// Runs the collect → estimate → optimize → checkpoint cycle until the step
/// budget is spent.
pub struct Trainer<E> {
    agent: PpoAgent,
    rollout: RolloutGenerator<E>,
    config: TrainConfig,
    rng: SmallRng,
    iterations: u64,
    best_avg_reward: f64,
}

impl<E: Environment> Trainer<E> {
    pub fn new(agent: PpoAgent, env: E, config: TrainConfig, ctx: &RunContext) -> Self {
        let rollout = RolloutGenerator::new(env, config.episode_cap, ctx.rng(1));
        Self {
            agent,
            rollout,
            config,
            rng: ctx.rng(2),
            iterations: 0,
            best_avg_reward: f64::NEG_INFINITY,
        }
    }

    pub fn agent(&self) -> &PpoAgent {
        &self.agent
    }

    pub fn stats(&self) -> &EpisodeStats {
        self.rollout.stats()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Picks up agent weights, optimizer state and reward statistics from
    /// the checkpoint directory. A missing checkpoint is not an error; a
    /// broken one logs a warning and training starts fresh.
    pub fn resume_or_fresh(&mut self) -> Result<()> {
        let dir = self.config.checkpoint_dir.clone();
        if !dir.join("meta.json").exists() {
            return Ok(());
        }
        match self.agent.resume_from(&dir) {
            Ok(meta) => {
                self.iterations = meta.iterations;
                self.best_avg_reward = meta.best_avg_reward;
                let recent = match load_recent_rewards(&dir) {
                    Ok(recent) => recent.unwrap_or_default(),
                    Err(err) => {
                        eprintln!("⚠️  Recent rewards load failed ({err}). Window starts empty.");
                        Vec::new()
                    }
                };
                self.rollout
                    .stats_mut()
                    .restore(meta.episodes, meta.total_steps, recent);
                eprintln!(
                    "📦 Resumed from {} (steps={}, episodes={}, iterations={})",
                    dir.display(),
                    meta.total_steps,
                    meta.episodes,
                    meta.iterations
                );
            }
            Err(err) => {
                eprintln!("⚠️  Checkpoint load failed ({err}). Starting fresh.");
            }
        }
        Ok(())
    }

    /// Normalized advantages for one segment, index-aligned with it. The
    /// bootstrap value comes from the final transition's next observation
    /// under the current parameters.
    fn advantages(&self, segment: &[Transition]) -> Result<Vec<f32>> {
        let rewards: Vec<f32> = segment.iter().map(|t| t.reward).collect();
        let values: Vec<f32> = segment.iter().map(|t| t.value).collect();
        let dones: Vec<bool> = segment.iter().map(|t| t.done).collect();
        let last = segment.last().context("empty trajectory segment")?;
        let last_value = self.agent.net().value(&last.next_state)?;
        let raw = estimate_advantages(
            &rewards,
            &values,
            &dones,
            last_value,
            self.agent.config.gamma,
            self.agent.config.lam,
        );
        Ok(normalize_advantages(&raw))
    }

    /// One full iteration: collect a segment, estimate advantages, then run
    /// the shuffled-minibatch epochs. Returns the last epoch's mean losses.
    pub fn run_iteration(&mut self) -> Result<Losses> {
        let segment_size = self.agent.config.segment_size();
        let segment = self.rollout.collect(self.agent.net(), segment_size)?;
        eprintln!(
            "Explored {} steps (total {})",
            segment.len(),
            self.rollout.stats().total_steps
        );
        let advantages = self.advantages(&segment)?;

        let epochs = self.agent.config.optimizer_epochs;
        let mut last_epoch = Losses {
            total: 0.0,
            policy: 0.0,
            value: 0.0,
            entropy: 0.0,
        };
        let mut indices: Vec<usize> = (0..segment.len()).collect();
        for epoch in 0..epochs {
            indices.shuffle(&mut self.rng);
            let mut sums = [0.0f64; 4];
            let mut batches = 0u32;
            for chunk in indices.chunks(self.agent.config.minibatch_size) {
                let batch =
                    Minibatch::from_transitions(self.agent.net(), &segment, &advantages, chunk)?;
                let losses = self.agent.optimize_step(&batch)?;
                sums[0] += losses.total as f64;
                sums[1] += losses.policy as f64;
                sums[2] += losses.value as f64;
                sums[3] += losses.entropy as f64;
                batches += 1;
            }
            let n = f64::from(batches.max(1));
            last_epoch = Losses {
                total: (sums[0] / n) as f32,
                policy: (sums[1] / n) as f32,
                value: (sums[2] / n) as f32,
                entropy: (sums[3] / n) as f32,
            };
            eprintln!(
                "Iter {:>5} | Epoch {}/{} | Loss {:>10.5} | Policy {:>10.5} | Value {:>10.5} | Entropy {:>8.4}",
                self.iterations + 1,
                epoch + 1,
                epochs,
                last_epoch.total,
                last_epoch.policy,
                last_epoch.value,
                last_epoch.entropy
            );
        }

        self.iterations += 1;
        let avg = self.rollout.stats().mean_recent();
        if avg > self.best_avg_reward {
            self.best_avg_reward = avg;
        }
        if self.iterations % self.config.checkpoint_every == 0 {
            self.checkpoint()?;
        }
        Ok(last_epoch)
    }

    fn checkpoint(&self) -> Result<()> {
        let meta = TrainMeta {
            best_avg_reward: self.best_avg_reward,
            iterations: self.iterations,
            total_steps: self.rollout.stats().total_steps,
            episodes: self.rollout.stats().episodes,
        };
        save_checkpoint(&self.agent, &meta, &self.config.checkpoint_dir)?;
        save_recent_rewards(&self.rollout.stats().recent(), &self.config.checkpoint_dir)?;
        eprintln!(
            "💾 Checkpoint saved to {} (iteration {})",
            self.config.checkpoint_dir.display(),
            self.iterations
        );
        Ok(())
    }

    /// Trains until the step budget is reached, then writes a final
    /// checkpoint.
    pub fn train(&mut self) -> Result<()> {
        let t_start = Instant::now();
        while self.rollout.stats().total_steps < self.config.max_steps {
            self.run_iteration()?;
        }
        self.checkpoint()?;
        eprintln!(
            "\n✅ Training complete. {} steps in {:.1}s",
            self.rollout.stats().total_steps,
            t_start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FakeEnv;
    use crate::model::test_model_config;
    use crate::ppo::PpoConfig;
    use candle_core::Device;

    fn tiny_ppo() -> PpoConfig {
        PpoConfig {
            model: test_model_config(),
            minibatch_size: 4,
            num_minibatches: 2,
            optimizer_epochs: 2,
            ..Default::default()
        }
    }

    #[test]
    fn doomed_episodes_get_negative_advantages_and_replay_improves() {
        let ctx = RunContext::new(Device::Cpu, Some(9)).unwrap();
        let mut config = tiny_ppo();
        config.lr = 1e-3;
        let mut agent = PpoAgent::new(&ctx.device, (16, 16, 2), 3, config).unwrap();

        let env = FakeEnv::new(16, 16, 2)
            .with_rewards(vec![1.0, 1.0, 1.0, 1.0, -5.0])
            .done_at(5)
            .with_actions(3);
        let mut generator = RolloutGenerator::new(env, None, ctx.rng(1));
        generator.verbose = false;
        let segment = generator.collect(agent.net(), 8).unwrap();

        let rewards: Vec<f32> = segment.iter().map(|t| t.reward).collect();
        let dones: Vec<bool> = segment.iter().map(|t| t.done).collect();
        assert_eq!(rewards, [1.0, 1.0, 1.0, 1.0, -5.0, 1.0, 1.0, 1.0]);
        assert_eq!(
            dones,
            [false, false, false, false, true, false, false, false]
        );

        // At a zero-value baseline every step of the doomed episode carries
        // the terminal penalty, while the fresh episode stays positive.
        let raw = estimate_advantages(&rewards, &[0.0; 8], &dones, 0.0, 0.99, 0.95);
        assert!(raw[..5].iter().all(|a| *a < 0.0), "{raw:?}");
        assert!(raw[5..].iter().all(|a| *a > 0.0), "{raw:?}");
        assert!(raw[4] < raw[3]);

        let advantages = normalize_advantages(&raw);
        let indices: Vec<usize> = (0..segment.len()).collect();
        let batch =
            Minibatch::from_transitions(agent.net(), &segment, &advantages, &indices).unwrap();
        let before = agent.losses(&batch).unwrap();
        for _ in 0..10 {
            agent.optimize_step(&batch).unwrap();
        }
        let after = agent.losses(&batch).unwrap();
        assert!(
            after.total < before.total,
            "loss did not improve: {} -> {}",
            before.total,
            after.total
        );
        assert_eq!(agent.skipped_steps, 0);
    }

    #[test]
    fn trains_checkpoints_and_resumes() {
        let dir = std::env::temp_dir().join(format!("nes-ppo-train-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let ctx = RunContext::new(Device::Cpu, Some(4)).unwrap();
        let config = TrainConfig {
            max_steps: 16,
            episode_cap: Some(3),
            checkpoint_every: 1,
            checkpoint_dir: dir.clone(),
        };
        let agent = PpoAgent::new(&ctx.device, (16, 16, 2), 3, tiny_ppo()).unwrap();
        let env = FakeEnv::new(16, 16, 2).with_actions(3);
        let mut trainer = Trainer::new(agent, env, config.clone(), &ctx);
        trainer.train().unwrap();
        assert_eq!(trainer.iterations(), 2);
        assert_eq!(trainer.stats().total_steps, 16);
        assert_eq!(trainer.stats().episodes, 5);

        let agent = PpoAgent::new(&ctx.device, (16, 16, 2), 3, tiny_ppo()).unwrap();
        let env = FakeEnv::new(16, 16, 2).with_actions(3);
        let mut resumed = Trainer::new(agent, env, config, &ctx);
        resumed.resume_or_fresh().unwrap();
        assert_eq!(resumed.iterations(), 2);
        assert_eq!(resumed.stats().total_steps, 16);
        assert_eq!(resumed.stats().episodes, 5);

        std::fs::remove_dir_all(&dir).ok();
    }
}
