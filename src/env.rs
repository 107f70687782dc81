use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::Rng;
use tetanes_core::input::JoypadBtnState;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

use crate::frame::Frame;
use crate::games::GameConfig;

pub const NES_HEIGHT: usize = 240;
pub const NES_WIDTH: usize = 256;

// =============================================================================
// Environment Interface
// =============================================================================

/// An observation: the processed frame handed to the agent plus the untouched
/// emulator frame, shared so renderers and trajectory buffers can hold it
/// without copying.
#[derive(Clone, Debug)]
pub struct Obs {
    pub frame: Frame,
    pub raw: Arc<Frame>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StepInfo {
    pub score: u32,
    pub lives: u8,
}

#[derive(Clone, Debug)]
pub struct Step {
    pub obs: Obs,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Anything that can be played: the emulator backend and every preprocessing
/// stage wrapped around it speak this trait.
pub trait Environment {
    fn reset(&mut self) -> Result<Obs>;

    /// Advances one step. `action` holds one flag per action slot; what a
    /// slot means (native button or curated action) depends on the stage.
    fn step(&mut self, action: &[bool]) -> Result<Step>;

    /// Shape (height, width, channels) of the observations this stage emits.
    fn obs_shape(&self) -> (usize, usize, usize);

    /// Length of the action vector `step` expects.
    fn num_actions(&self) -> usize;
}

// =============================================================================
// Emulator Constants
// =============================================================================

pub struct EnvConfig {
    /// Random no-op frames clocked after reset, before anything is pressed.
    pub random_noop_range: std::ops::Range<u32>,
    pub start_press_frames: u32,
    pub start_press_interval: u32,
    /// Frames clocked after the last START press, letting intros play out.
    pub settle_frames: u32,
    /// Probability that a step repeats the previous frame's buttons instead
    /// of the requested ones. Zero keeps rollouts action-deterministic.
    pub sticky_button_prob: f64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            random_noop_range: 1..31,
            start_press_frames: 2,
            start_press_interval: 30,
            settle_frames: 60,
            sticky_button_prob: 0.0,
        }
    }
}

// =============================================================================
// NES Backend
// =============================================================================

pub struct NesEnv {
    deck: ControlDeck,
    game: GameConfig,
    config: EnvConfig,
    rng: SmallRng,
    prev_score: u32,
    prev_lives: u8,
    last_buttons: JoypadBtnState,
}

impl NesEnv {
    pub fn new(
        rom_path: &Path,
        game: GameConfig,
        config: EnvConfig,
        rng: SmallRng,
    ) -> Result<Self> {
        let mut deck = ControlDeck::new();
        // Video stays on: the frame buffer is the observation.
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        deck.load_rom_path(rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;
        Ok(Self {
            deck,
            game,
            config,
            rng,
            prev_score: 0,
            prev_lives: 0,
            last_buttons: JoypadBtnState::empty(),
        })
    }

    pub fn game(&self) -> &GameConfig {
        &self.game
    }

    fn clock_frame(&mut self) -> Result<()> {
        self.deck.clock_frame()?;
        Ok(())
    }

    fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    /// Score digits are stored one BCD digit per byte, most significant first.
    fn read_score(&self) -> u32 {
        let mut score = 0u32;
        for &addr in self.game.score_digits {
            score = score * 10 + u32::from(self.peek(addr) & 0x0F);
        }
        score
    }

    fn read_lives(&self) -> u8 {
        self.game.lives_addr.map(|addr| self.peek(addr)).unwrap_or(0)
    }

    fn apply_state(&mut self, state: JoypadBtnState) {
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::TURBO_A,
            JoypadBtnState::TURBO_B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, state.contains(button));
        }
    }

    fn press_start(&mut self, frames: u32) -> Result<()> {
        let mut state = JoypadBtnState::empty();
        state.set(JoypadBtnState::START, true);
        for _ in 0..frames {
            self.apply_state(state);
            self.clock_frame()?;
        }
        self.apply_state(JoypadBtnState::empty());
        Ok(())
    }

    fn grab_obs(&mut self) -> Result<Obs> {
        let frame = Frame::from_rgba(NES_HEIGHT, NES_WIDTH, self.deck.frame_buffer())?;
        let raw = Arc::new(frame);
        Ok(Obs {
            frame: (*raw).clone(),
            raw,
        })
    }
}

/// Converts a press vector in [`crate::actions::NES_BUTTONS`] order into the
/// emulator's button state.
pub(crate) fn joypad_state(buttons: &[bool]) -> JoypadBtnState {
    const SLOTS: [JoypadBtnState; 8] = [
        JoypadBtnState::B,
        JoypadBtnState::A,
        JoypadBtnState::SELECT,
        JoypadBtnState::START,
        JoypadBtnState::UP,
        JoypadBtnState::DOWN,
        JoypadBtnState::LEFT,
        JoypadBtnState::RIGHT,
    ];
    let mut state = JoypadBtnState::empty();
    for (&slot, &pressed) in SLOTS.iter().zip(buttons) {
        state.set(slot, pressed);
    }
    state
}

impl Environment for NesEnv {
    /// Soft reset, a random burst of no-op frames, START presses to get past
    /// the title screen, then settle frames. Gym-style emulators restore a
    /// savestate here; this backend replays the boot sequence instead.
    fn reset(&mut self) -> Result<Obs> {
        self.deck.reset(ResetKind::Soft);
        let noops = self
            .rng
            .random_range(self.config.random_noop_range.clone());
        for _ in 0..noops {
            self.clock_frame()?;
        }
        for press in 0..self.game.start_presses {
            if press > 0 {
                for _ in 0..self.config.start_press_interval {
                    self.clock_frame()?;
                }
            }
            self.press_start(self.config.start_press_frames)?;
        }
        for _ in 0..self.config.settle_frames {
            self.clock_frame()?;
        }
        self.prev_score = self.read_score();
        self.prev_lives = self.read_lives();
        self.last_buttons = JoypadBtnState::empty();
        self.grab_obs()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let requested = joypad_state(action);
        let effective = if self.config.sticky_button_prob > 0.0
            && self.rng.random::<f64>() < self.config.sticky_button_prob
        {
            self.last_buttons
        } else {
            requested
        };
        self.apply_state(effective);
        self.last_buttons = effective;
        self.clock_frame()?;

        let score = self.read_score();
        let lives = self.read_lives();
        let delta = i64::from(score) - i64::from(self.prev_score);
        // Digits mid-update can read as garbage; discard implausible jumps.
        let reward = if delta > 0 && delta < self.game.max_score_delta {
            delta as f64
        } else {
            0.0
        };
        let done = self.prev_lives > 0 && lives < self.prev_lives;
        self.prev_score = score;
        self.prev_lives = lives;

        let obs = self.grab_obs()?;
        Ok(Step {
            obs,
            reward,
            done,
            info: StepInfo { score, lives },
        })
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        (NES_HEIGHT, NES_WIDTH, 3)
    }

    fn num_actions(&self) -> usize {
        crate::actions::NES_BUTTONS.len()
    }
}

// =============================================================================
// Test Double
// =============================================================================

/// Scripted environment for exercising the pipeline and trainer without an
/// emulator. Frames are filled with a counter byte that ticks on every reset
/// and step, so each observation is distinguishable.
#[cfg(test)]
pub(crate) struct FakeEnv {
    height: usize,
    width: usize,
    channels: usize,
    num_actions: usize,
    rewards: Vec<f64>,
    done_at: Option<usize>,
    flicker: bool,
    counter: u8,
    episode_steps: usize,
    pub actions_seen: Vec<Vec<bool>>,
    pub resets: usize,
}

#[cfg(test)]
impl FakeEnv {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            num_actions: crate::actions::NES_BUTTONS.len(),
            rewards: Vec::new(),
            done_at: None,
            flicker: false,
            counter: 0,
            episode_steps: 0,
            actions_seen: Vec::new(),
            resets: 0,
        }
    }

    /// Per-episode reward schedule, cycled if an episode outlives it.
    /// Without one every step pays 1.0.
    pub fn with_rewards(mut self, rewards: Vec<f64>) -> Self {
        self.rewards = rewards;
        self
    }

    /// Episodes end on their `n`-th step.
    pub fn done_at(mut self, n: usize) -> Self {
        self.done_at = Some(n);
        self
    }

    pub fn with_actions(mut self, n: usize) -> Self {
        self.num_actions = n;
        self
    }

    /// Emulates sprite flicker: even-counter frames light only even pixels,
    /// odd-counter frames only odd ones.
    pub fn flicker(mut self) -> Self {
        self.flicker = true;
        self
    }

    fn obs(&self) -> Obs {
        let len = self.height * self.width * self.channels;
        let data = if self.flicker {
            (0..len)
                .map(|i| {
                    if (i % 2 == 0) == (self.counter % 2 == 0) {
                        self.counter
                    } else {
                        0
                    }
                })
                .collect()
        } else {
            vec![self.counter; len]
        };
        let raw = Arc::new(Frame {
            height: self.height,
            width: self.width,
            channels: self.channels,
            data,
        });
        Obs {
            frame: (*raw).clone(),
            raw,
        }
    }
}

#[cfg(test)]
impl Environment for FakeEnv {
    fn reset(&mut self) -> Result<Obs> {
        self.resets += 1;
        self.counter = self.counter.wrapping_add(1);
        self.episode_steps = 0;
        Ok(self.obs())
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        self.actions_seen.push(action.to_vec());
        self.counter = self.counter.wrapping_add(1);
        self.episode_steps += 1;
        let reward = if self.rewards.is_empty() {
            1.0
        } else {
            self.rewards[(self.episode_steps - 1) % self.rewards.len()]
        };
        let done = self.done_at.is_some_and(|n| self.episode_steps >= n);
        Ok(Step {
            obs: self.obs(),
            reward,
            done,
            info: StepInfo::default(),
        })
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_vector_maps_to_joypad_flags() {
        let mut buttons = vec![false; 8];
        buttons[1] = true; // A
        buttons[3] = true; // START
        buttons[7] = true; // RIGHT
        let state = joypad_state(&buttons);
        assert!(state.contains(JoypadBtnState::A));
        assert!(state.contains(JoypadBtnState::START));
        assert!(state.contains(JoypadBtnState::RIGHT));
        assert!(!state.contains(JoypadBtnState::B));
        assert!(!state.contains(JoypadBtnState::LEFT));
        assert_eq!(joypad_state(&[false; 8]), JoypadBtnState::empty());
    }

    #[test]
    fn fake_env_replays_its_schedule() {
        let mut env = FakeEnv::new(2, 2, 1)
            .with_rewards(vec![1.0, 1.0, -5.0])
            .done_at(3);
        let first = env.reset().unwrap();
        let mut seen = vec![first.frame.data[0]];
        for expected in [(1.0, false), (1.0, false), (-5.0, true)] {
            let step = env.step(&[false; 8]).unwrap();
            assert_eq!((step.reward, step.done), expected);
            seen.push(step.obs.frame.data[0]);
        }
        seen.dedup();
        assert_eq!(seen.len(), 4, "every observation is distinguishable");
        env.reset().unwrap();
        assert_eq!(env.resets, 2);
        let step = env.step(&[false; 8]).unwrap();
        assert_eq!(step.reward, 1.0);
        assert!(!step.done);
    }
}
