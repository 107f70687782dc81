use std::collections::VecDeque;

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::env::Environment;
use crate::frame::Frame;
use crate::model::PolicyValueNet;

pub struct EvalStats {
    pub avg_reward: f64,
    pub avg_score: f64,
    pub best_reward: f64,
    pub episodes: usize,
}

/// Where the gate vector comes from: the stochastic policy, or coin flips
/// for the random baseline.
enum GateSource<'a> {
    Policy(&'a PolicyValueNet),
    Random,
}

impl GateSource<'_> {
    fn gates(&self, frame: &Frame, num_gates: usize, rng: &mut SmallRng) -> Result<Vec<bool>> {
        match self {
            GateSource::Policy(net) => Ok(net.select_action(frame, rng)?.0),
            GateSource::Random => Ok((0..num_gates).map(|_| rng.random::<bool>()).collect()),
        }
    }
}

/// Runs the trained policy for a number of episodes, sampling actions the
/// same way training does. Works on any environment, rendered or headless.
pub fn run_eval<E: Environment>(
    net: &PolicyValueNet,
    env: E,
    episodes: usize,
    episode_cap: Option<u64>,
    rng: SmallRng,
) -> Result<EvalStats> {
    run_episodes(GateSource::Policy(net), env, episodes, episode_cap, rng)
}

/// Random-gate reference score for the same environment setup.
pub fn run_baseline<E: Environment>(
    env: E,
    episodes: usize,
    episode_cap: Option<u64>,
    rng: SmallRng,
) -> Result<EvalStats> {
    run_episodes(GateSource::Random, env, episodes, episode_cap, rng)
}

fn run_episodes<E: Environment>(
    source: GateSource<'_>,
    mut env: E,
    episodes: usize,
    episode_cap: Option<u64>,
    mut rng: SmallRng,
) -> Result<EvalStats> {
    let episodes = episodes.max(1);
    let num_gates = env.num_actions();

    let mut recent: VecDeque<f64> = VecDeque::with_capacity(5);
    let mut total_reward = 0.0f64;
    let mut total_score = 0u64;
    let mut best_reward = f64::NEG_INFINITY;

    for episode in 1..=episodes {
        let mut obs = env.reset()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;
        let mut score = 0u32;

        loop {
            let gates = source.gates(&obs.frame, num_gates, &mut rng)?;
            let step = env.step(&gates)?;
            ep_reward += step.reward;
            ep_steps += 1;
            score = step.info.score;
            obs = step.obs;
            if step.done || episode_cap.is_some_and(|cap| ep_steps >= cap) {
                break;
            }
        }

        total_reward += ep_reward;
        total_score += u64::from(score);
        if ep_reward > best_reward {
            best_reward = ep_reward;
        }
        if recent.len() == 5 {
            recent.pop_front();
        }
        recent.push_back(ep_reward);
        let avg5: f64 = recent.iter().sum::<f64>() / recent.len() as f64;
        eprintln!(
            "Ep {:>3}/{} | R {:>8.2} | Avg5 {:>8.2} | Len {:>6} | Score {:>6}",
            episode, episodes, ep_reward, avg5, ep_steps, score
        );
    }

    let denom = episodes as f64;
    Ok(EvalStats {
        avg_reward: total_reward / denom,
        avg_score: total_score as f64 / denom,
        best_reward,
        episodes,
    })
}
