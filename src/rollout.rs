use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::SmallRng;

use crate::env::Environment;
use crate::env::Obs;
use crate::frame::Frame;
use crate::model::PolicyValueNet;

/// Episodes kept in the trailing reward average.
const RECENT_WINDOW: usize = 100;

// =============================================================================
// Transitions
// =============================================================================

/// One agent step. `log_probs` and `value` come from the parameters that
/// sampled `gates`; they must not be recomputed after an update.
pub struct Transition {
    /// Native emulator frame the step started from. Shared with the
    /// previous transition's `next_raw` when no reset happened in between.
    pub raw: Arc<Frame>,
    /// Stacked observation the action was chosen from.
    pub state: Frame,
    /// Which action gates fired.
    pub gates: Vec<bool>,
    /// Per-gate log-probability of what was sampled.
    pub log_probs: Vec<f32>,
    /// State value under the sampling parameters.
    pub value: f32,
    pub reward: f32,
    /// True only on a real terminal. An episode cut off by the step cap
    /// keeps `done = false` so the advantage estimate bootstraps across it.
    pub done: bool,
    /// Native emulator frame after the step.
    pub next_raw: Arc<Frame>,
    /// Stacked observation after the step.
    pub next_state: Frame,
}

// =============================================================================
// Episode Statistics
// =============================================================================

/// Totals for the episode that just finished.
pub struct EpisodeSummary {
    pub reward: f64,
    pub length: u64,
    /// Mean reward over the last `RECENT_WINDOW` finished episodes,
    /// including this one.
    pub mean_recent: f64,
    pub score: u32,
}

/// Running reward bookkeeping across episodes.
pub struct EpisodeStats {
    pub episodes: u64,
    pub total_steps: u64,
    recent: VecDeque<f64>,
    current_reward: f64,
    current_len: u64,
    last_score: u32,
}

impl EpisodeStats {
    pub fn new() -> Self {
        Self {
            episodes: 0,
            total_steps: 0,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
            current_reward: 0.0,
            current_len: 0,
            last_score: 0,
        }
    }

    pub fn on_step(&mut self, reward: f64, score: u32) {
        self.total_steps += 1;
        self.current_reward += reward;
        self.current_len += 1;
        self.last_score = score;
    }

    pub fn on_episode_end(&mut self) -> EpisodeSummary {
        self.episodes += 1;
        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(self.current_reward);
        let summary = EpisodeSummary {
            reward: self.current_reward,
            length: self.current_len,
            mean_recent: self.mean_recent(),
            score: self.last_score,
        };
        self.current_reward = 0.0;
        self.current_len = 0;
        self.last_score = 0;
        summary
    }

    pub fn mean_recent(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().sum::<f64>() / self.recent.len() as f64
        }
    }

    /// Snapshot of the reward window, oldest first.
    pub fn recent(&self) -> Vec<f64> {
        self.recent.iter().copied().collect()
    }

    /// Reloads counters saved by a previous run.
    pub fn restore(&mut self, episodes: u64, total_steps: u64, recent: Vec<f64>) {
        self.episodes = episodes;
        self.total_steps = total_steps;
        self.recent = recent.into_iter().collect();
        while self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }
}

impl Default for EpisodeStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Rollout Generation
// =============================================================================

/// Streams transitions from an environment, resetting between episodes so
/// the caller sees one unbroken sequence. Episode boundaries are carried in
/// the transitions themselves.
pub struct RolloutGenerator<E> {
    env: E,
    obs: Option<Obs>,
    /// Episodes longer than this are cut off and the environment reset,
    /// without marking the final transition terminal.
    episode_cap: Option<u64>,
    episode_steps: u64,
    stats: EpisodeStats,
    rng: SmallRng,
    /// Print a summary line when an episode finishes.
    pub verbose: bool,
}

impl<E: Environment> RolloutGenerator<E> {
    pub fn new(env: E, episode_cap: Option<u64>, rng: SmallRng) -> Self {
        Self {
            env,
            obs: None,
            episode_cap,
            episode_steps: 0,
            stats: EpisodeStats::new(),
            rng,
            verbose: true,
        }
    }

    pub fn stats(&self) -> &EpisodeStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut EpisodeStats {
        &mut self.stats
    }

    /// Samples one action from `net`, steps the environment, and returns the
    /// transition. Resets the environment first if the previous call ended an
    /// episode.
    pub fn next(&mut self, net: &PolicyValueNet) -> Result<Transition> {
        let obs = match self.obs.take() {
            Some(obs) => obs,
            None => {
                self.episode_steps = 0;
                self.env.reset()?
            }
        };
        let (gates, log_probs, value) = net.select_action(&obs.frame, &mut self.rng)?;
        let step = self.env.step(&gates)?;
        self.episode_steps += 1;
        self.stats.on_step(step.reward, step.info.score);

        let capped = self.episode_cap.is_some_and(|cap| self.episode_steps >= cap);
        let transition = Transition {
            raw: obs.raw,
            state: obs.frame,
            gates,
            log_probs,
            value,
            reward: step.reward as f32,
            done: step.done,
            next_raw: step.obs.raw.clone(),
            next_state: step.obs.frame.clone(),
        };
        if step.done || capped {
            let summary = self.stats.on_episode_end();
            if self.verbose {
                eprintln!(
                    "Ep {:>5} | Steps {:>9} | R {:>8.2} | Avg100 {:>8.2} | Len {:>6} | Score {:>6}",
                    self.stats.episodes,
                    self.stats.total_steps,
                    summary.reward,
                    summary.mean_recent,
                    summary.length,
                    summary.score,
                );
            }
            self.obs = None;
        } else {
            self.obs = Some(step.obs);
        }
        Ok(transition)
    }

    /// Collects a fixed-length segment, spanning episode boundaries.
    pub fn collect(&mut self, net: &PolicyValueNet, n: usize) -> Result<Vec<Transition>> {
        let mut segment = Vec::with_capacity(n);
        for _ in 0..n {
            segment.push(self.next(net)?);
        }
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FakeEnv;
    use crate::model::test_net;
    use rand::SeedableRng;

    fn generator(env: FakeEnv, cap: Option<u64>) -> RolloutGenerator<FakeEnv> {
        let mut generator = RolloutGenerator::new(env, cap, SmallRng::seed_from_u64(3));
        generator.verbose = false;
        generator
    }

    #[test]
    fn steps_and_resets_transparently() {
        let env = FakeEnv::new(16, 16, 2).done_at(3);
        let net = test_net((16, 16, 2), 8);
        let mut generator = generator(env, None);
        let segment = generator.collect(&net, 7).unwrap();

        let dones: Vec<bool> = segment.iter().map(|t| t.done).collect();
        assert_eq!(dones, [false, false, true, false, false, true, false]);
        assert_eq!(generator.stats().episodes, 2);
        assert_eq!(generator.stats().total_steps, 7);
        // After a terminal the next state comes from a fresh reset, which
        // advances the fake counter once more than the last next_state.
        assert_eq!(segment[3].state.data[0], segment[2].next_state.data[0] + 1);
        // Within an episode adjacent transitions share the raw frame buffer;
        // a reset breaks the chain.
        assert!(Arc::ptr_eq(&segment[0].next_raw, &segment[1].raw));
        assert!(Arc::ptr_eq(&segment[1].next_raw, &segment[2].raw));
        assert!(!Arc::ptr_eq(&segment[2].next_raw, &segment[3].raw));
    }

    #[test]
    fn episode_cap_truncates_without_a_terminal() {
        let env = FakeEnv::new(16, 16, 2);
        let net = test_net((16, 16, 2), 8);
        let mut generator = generator(env, Some(4));
        let segment = generator.collect(&net, 6).unwrap();

        assert!(segment.iter().all(|t| !t.done));
        assert_eq!(generator.stats().episodes, 1);
        assert_eq!(generator.stats().total_steps, 6);
        // The environment was still reset between steps 3 and 4.
        assert_eq!(segment[4].state.data[0], segment[3].next_state.data[0] + 1);
    }

    #[test]
    fn transitions_carry_one_log_prob_per_gate() {
        let env = FakeEnv::new(16, 16, 2).with_actions(5);
        let net = test_net((16, 16, 2), 5);
        let mut generator = generator(env, None);
        for transition in generator.collect(&net, 3).unwrap() {
            assert_eq!(transition.gates.len(), 5);
            assert_eq!(transition.log_probs.len(), 5);
            for lp in &transition.log_probs {
                assert!(*lp <= 1e-5, "log-probability above zero: {lp}");
            }
            assert!(transition.value.is_finite());
        }
    }

    #[test]
    fn reward_window_keeps_the_trailing_hundred() {
        let mut stats = EpisodeStats::new();
        for i in 0..150 {
            stats.on_step(f64::from(i), 42);
            let summary = stats.on_episode_end();
            assert_eq!(summary.length, 1);
            assert_eq!(summary.score, 42);
        }
        assert_eq!(stats.episodes, 150);
        assert_eq!(stats.recent().len(), 100);
        // Window holds episodes 50..150, whose rewards average 99.5.
        assert!((stats.mean_recent() - 99.5).abs() < 1e-9);
    }

    #[test]
    fn restore_trims_the_reward_window() {
        let mut stats = EpisodeStats::new();
        stats.restore(7, 1_000, vec![2.0; 150]);
        assert_eq!(stats.episodes, 7);
        assert_eq!(stats.total_steps, 1_000);
        assert_eq!(stats.recent().len(), 100);
        assert!((stats.mean_recent() - 2.0).abs() < 1e-9);
    }
}
