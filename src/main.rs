// =============================================================================
// NES Side-Scroller — PPO Reinforcement Learning Agent in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --rom kung_fu.nes
//   cargo run --release -- train --rom smb.nes --game super-mario-bros --render
//   cargo run --release -- play  --rom kung_fu.nes
//   cargo run --release -- eval  --rom kung_fu.nes --episodes 20
//   cargo run --release -- baseline --rom kung_fu.nes

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use nes_ppo::env::{NES_HEIGHT, NES_WIDTH};
use nes_ppo::games;
use nes_ppo::{
    run_baseline, run_eval, wrap, ActionAdapter, ActionMap, EnvConfig, Environment, Frame,
    GameConfig, NesEnv, Obs, PipelineConfig, PpoAgent, PpoConfig, RunContext, Step, TrainConfig,
    Trainer, NES_BUTTONS,
};

// =============================================================================
// Render Window
// =============================================================================

/// The user closed the render window. Commands catch it and shut down
/// cleanly instead of reporting a failure.
#[derive(Clone, Copy, Debug)]
struct WindowClosed;

impl fmt::Display for WindowClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "render window closed")
    }
}

impl std::error::Error for WindowClosed {}

fn blit_rgb_to_u32(rgb: &[u8], out: &mut [u32]) {
    for (dst, src) in out.iter_mut().zip(rgb.chunks_exact(3)) {
        *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
    }
}

/// Stage that mirrors the raw emulator frame into a window while passing
/// everything else through untouched.
///
/// Works at any depth in the chain: directly around [`NesEnv`] it shows
/// every native frame (play mode, throttled to 60 fps), outside the
/// preprocessing pipeline it shows one frame per agent step (training).
/// Space pauses; closing the window surfaces [`WindowClosed`].
struct Rendered<E> {
    env: E,
    window: minifb::Window,
    buf: Vec<u32>,
    title: String,
    steps: u64,
    episodes: u64,
    episode_reward: f64,
    last_score: u32,
    last_title: Instant,
}

impl<E: Environment> Rendered<E> {
    fn new(env: E, title: &str, target_fps: Option<usize>) -> Result<Self> {
        let mut window = minifb::Window::new(
            title,
            NES_WIDTH,
            NES_HEIGHT,
            minifb::WindowOptions {
                resize: true,
                scale: minifb::Scale::X2,
                ..Default::default()
            },
        )?;
        if let Some(fps) = target_fps {
            window.set_target_fps(fps);
        }
        Ok(Self {
            env,
            window,
            buf: Vec::new(),
            title: title.to_string(),
            steps: 0,
            episodes: 0,
            episode_reward: 0.0,
            last_score: 0,
            last_title: Instant::now(),
        })
    }

    fn draw(&mut self, raw: &Frame) -> Result<()> {
        if !self.window.is_open() {
            return Err(WindowClosed.into());
        }
        if self
            .window
            .is_key_pressed(minifb::Key::Space, minifb::KeyRepeat::No)
        {
            self.pause()?;
        }
        if self.last_title.elapsed() > Duration::from_millis(250) {
            self.window.set_title(&format!(
                "{} | Ep {} | Steps {} | R {:.1} | Score {}",
                self.title,
                self.episodes + 1,
                self.steps,
                self.episode_reward,
                self.last_score
            ));
            self.last_title = Instant::now();
        }
        self.buf.resize(raw.height * raw.width, 0);
        blit_rgb_to_u32(&raw.data, &mut self.buf);
        self.window
            .update_with_buffer(&self.buf, raw.width, raw.height)?;
        Ok(())
    }

    /// Blocks until space is pressed again, keeping the window responsive.
    fn pause(&mut self) -> Result<()> {
        loop {
            self.window.update();
            if !self.window.is_open() {
                return Err(WindowClosed.into());
            }
            if self
                .window
                .is_key_pressed(minifb::Key::Space, minifb::KeyRepeat::No)
            {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(16));
        }
    }
}

impl<E: Environment> Environment for Rendered<E> {
    fn reset(&mut self) -> Result<Obs> {
        let obs = self.env.reset()?;
        self.episode_reward = 0.0;
        self.draw(&obs.raw)?;
        Ok(obs)
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let step = self.env.step(action)?;
        self.steps += 1;
        self.episode_reward += step.reward;
        self.last_score = step.info.score;
        if step.done {
            self.episodes += 1;
        }
        self.draw(&step.obs.raw)?;
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
// Environment Assembly
// =============================================================================

fn select_device(cpu: bool) -> Device {
    // Metal on Apple Silicon, else CPU
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

/// Curated action gates plus the preprocessing chain around any frame
/// source.
fn assemble<E: Environment>(
    env: E,
    game: &GameConfig,
    pipeline: PipelineConfig,
) -> Result<impl Environment> {
    let map = ActionMap::new(&NES_BUTTONS, game.actions)?;
    Ok(wrap(ActionAdapter::new(env, map), pipeline))
}

/// Pipeline with only the observation-shaping knobs set. Play and eval must
/// match the shapes training used or the checkpoint will not load.
fn observation_pipeline(
    frame_skip: usize,
    max_pool: usize,
    warp_size: usize,
    keep_color: bool,
    stack: usize,
) -> PipelineConfig {
    PipelineConfig {
        skip: frame_skip,
        max_pool,
        warp_height: warp_size,
        warp_width: warp_size,
        keep_color,
        stack,
        ..PipelineConfig::default()
    }
}

// =============================================================================
// Training
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — NES Side-Scroller PPO Agent (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);
    let ctx = RunContext::new(device, args.seed)?;

    let game = games::for_name(&args.game);
    eprintln!("Game: {} ({} action gates)", game.name, game.actions.len());
    if let Some(pad) = args.pad_action {
        ensure!(
            pad < game.actions.len(),
            "--pad-action {pad} out of range for {} curated actions",
            game.actions.len()
        );
    }

    let env_config = EnvConfig {
        sticky_button_prob: args.sticky,
        ..Default::default()
    };
    let nes = NesEnv::new(&args.rom, game, env_config, ctx.rng(0))?;
    let env = assemble(nes, &game, train_pipeline(args, &game))?;

    let ppo = PpoConfig {
        clip_epsilon: args.clip_epsilon,
        value_coef: args.value_coef,
        entropy_coef: args.entropy_coef,
        gamma: args.gamma,
        lam: args.lam,
        lr: args.lr,
        optimizer_epochs: args.epochs,
        minibatch_size: args.minibatch_size,
        num_minibatches: args.num_minibatches,
        ..Default::default()
    };
    let agent = PpoAgent::new(&ctx.device, env.obs_shape(), env.num_actions(), ppo)?;

    let config = TrainConfig {
        max_steps: args.timesteps,
        episode_cap: Some(args.episode_cap),
        checkpoint_every: 10,
        checkpoint_dir: args.checkpoint_dir.clone(),
    };

    if args.render {
        let env = Rendered::new(env, "NES PPO — Training", None)?;
        run_train(agent, env, config, &ctx, args.restart)
    } else {
        run_train(agent, env, config, &ctx, args.restart)
    }
}

fn train_pipeline(args: &TrainArgs, game: &GameConfig) -> PipelineConfig {
    PipelineConfig {
        skip: args.frame_skip,
        max_pool: args.max_pool,
        pad_action: args.pad_action.map(|i| {
            let mut gates = vec![false; game.actions.len()];
            gates[i] = true;
            gates
        }),
        reward_scale: args.reward_scale,
        clip_rewards: args.clip_rewards,
        warp_height: args.warp_size,
        warp_width: args.warp_size,
        keep_color: args.keep_color,
        stack: args.stack,
        time_penalty: args.time_penalty,
    }
}

fn run_train<E: Environment>(
    agent: PpoAgent,
    env: E,
    config: TrainConfig,
    ctx: &RunContext,
    restart: bool,
) -> Result<()> {
    let mut trainer = Trainer::new(agent, env, config, ctx);
    if restart {
        eprintln!("Starting fresh (--restart): ignoring any existing checkpoint");
    } else {
        trainer.resume_or_fresh()?;
    }
    trainer.train()
}

// =============================================================================
// Play / Evaluate
// =============================================================================

fn load_agent(
    ctx: &RunContext,
    obs_shape: (usize, usize, usize),
    num_actions: usize,
    checkpoint_dir: &Path,
) -> Result<PpoAgent> {
    let mut agent = PpoAgent::new(&ctx.device, obs_shape, num_actions, PpoConfig::default())?;
    let model_path = checkpoint_dir.join("model.safetensors");
    agent
        .load(&model_path.to_string_lossy())
        .with_context(|| format!("Failed to load model from {}", model_path.display()))?;
    Ok(agent)
}

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  PLAYING — NES Side-Scroller PPO Agent");
    eprintln!("═══════════════════════════════════════════════════════════");

    let ctx = RunContext::new(select_device(args.cpu), args.seed)?;
    let game = games::for_name(&args.game);

    let nes = NesEnv::new(&args.rom, game, EnvConfig::default(), ctx.rng(0))?;
    let rendered = Rendered::new(nes, "NES PPO — Agent", Some(60))?;
    let env = assemble(
        rendered,
        &game,
        observation_pipeline(
            args.frame_skip,
            args.max_pool,
            args.warp_size,
            args.keep_color,
            args.stack,
        ),
    )?;

    let agent = load_agent(&ctx, env.obs_shape(), env.num_actions(), &args.checkpoint_dir)?;
    let stats = run_eval(
        agent.net(),
        env,
        args.episodes,
        Some(args.episode_cap),
        ctx.rng(3),
    )?;
    eprintln!(
        "\nPlayed {} episodes: avg reward {:.2} | best {:.2} | avg score {:.0}",
        stats.episodes, stats.avg_reward, stats.best_reward, stats.avg_score
    );
    Ok(())
}

fn eval(args: &EvalArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  EVALUATING — NES Side-Scroller PPO Agent");
    eprintln!("═══════════════════════════════════════════════════════════");

    let ctx = RunContext::new(select_device(args.cpu), args.seed)?;
    let game = games::for_name(&args.game);

    let nes = NesEnv::new(&args.rom, game, EnvConfig::default(), ctx.rng(0))?;
    let env = assemble(
        nes,
        &game,
        observation_pipeline(
            args.frame_skip,
            args.max_pool,
            args.warp_size,
            args.keep_color,
            args.stack,
        ),
    )?;

    let agent = load_agent(&ctx, env.obs_shape(), env.num_actions(), &args.checkpoint_dir)?;
    let stats = run_eval(
        agent.net(),
        env,
        args.episodes,
        Some(args.episode_cap),
        ctx.rng(3),
    )?;
    eprintln!(
        "\nEval over {} episodes: avg reward {:.2} | best {:.2} | avg score {:.0}",
        stats.episodes, stats.avg_reward, stats.best_reward, stats.avg_score
    );
    Ok(())
}

// =============================================================================
// Random Baseline
// =============================================================================

fn baseline(args: &BaselineArgs) -> Result<()> {
    eprintln!("Running random-gate baseline...");

    let ctx = RunContext::new(Device::Cpu, args.seed)?;
    let game = games::for_name(&args.game);

    let nes = NesEnv::new(&args.rom, game, EnvConfig::default(), ctx.rng(0))?;
    let env = assemble(
        nes,
        &game,
        observation_pipeline(
            args.frame_skip,
            args.max_pool,
            args.warp_size,
            args.keep_color,
            args.stack,
        ),
    )?;

    let stats = run_baseline(env, args.episodes, Some(args.episode_cap), ctx.rng(3))?;
    eprintln!(
        "\nBaseline over {} episodes: avg reward {:.2} | best {:.2} | avg score {:.0}",
        stats.episodes, stats.avg_reward, stats.best_reward, stats.avg_score
    );
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "nes-ppo",
    about = "NES side-scrollers — PPO agent that learns from pixels"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the PPO agent
    Train(TrainArgs),
    /// Watch the trained agent play in a window
    Play(PlayArgs),
    /// Score the trained agent headlessly
    Eval(EvalArgs),
    /// Run random agent baseline
    Baseline(BaselineArgs),
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    game: String,
    #[arg(long, default_value = "50000000")]
    timesteps: u64,
    #[arg(long, default_value = "10000")]
    episode_cap: u64,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    restart: bool,
    #[arg(long, default_value_t = false)]
    render: bool,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "4")]
    epochs: usize,
    #[arg(long, default_value = "32")]
    minibatch_size: usize,
    #[arg(long, default_value = "32")]
    num_minibatches: usize,
    #[arg(long, default_value = "0.0001")]
    lr: f64,
    #[arg(long, default_value = "0.1")]
    clip_epsilon: f64,
    #[arg(long, default_value = "1.0")]
    value_coef: f64,
    #[arg(long, default_value = "0.01", allow_hyphen_values = true)]
    entropy_coef: f64,
    #[arg(long, default_value = "0.99")]
    gamma: f32,
    #[arg(long, default_value = "0.95")]
    lam: f32,

    #[arg(long, default_value = "4")]
    frame_skip: usize,
    #[arg(long, default_value = "1")]
    max_pool: usize,
    #[arg(long)]
    pad_action: Option<usize>,
    #[arg(long, default_value = "0.01")]
    reward_scale: f64,
    #[arg(long, default_value_t = false)]
    clip_rewards: bool,
    #[arg(long, default_value = "80")]
    warp_size: usize,
    #[arg(long, default_value_t = false)]
    keep_color: bool,
    #[arg(long, default_value = "4")]
    stack: usize,
    #[arg(long, default_value = "0.0")]
    time_penalty: f64,
    #[arg(long, default_value = "0.0")]
    sticky: f64,
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    game: String,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "20000")]
    episode_cap: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = "4")]
    frame_skip: usize,
    #[arg(long, default_value = "1")]
    max_pool: usize,
    #[arg(long, default_value = "80")]
    warp_size: usize,
    #[arg(long, default_value_t = false)]
    keep_color: bool,
    #[arg(long, default_value = "4")]
    stack: usize,
}

#[derive(Parser)]
struct EvalArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    game: String,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, default_value = "10")]
    episodes: usize,
    #[arg(long, default_value = "20000")]
    episode_cap: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = "4")]
    frame_skip: usize,
    #[arg(long, default_value = "1")]
    max_pool: usize,
    #[arg(long, default_value = "80")]
    warp_size: usize,
    #[arg(long, default_value_t = false)]
    keep_color: bool,
    #[arg(long, default_value = "4")]
    stack: usize,
}

#[derive(Parser)]
struct BaselineArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    game: String,
    #[arg(long, default_value = "10")]
    episodes: usize,
    #[arg(long, default_value = "20000")]
    episode_cap: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = "4")]
    frame_skip: usize,
    #[arg(long, default_value = "1")]
    max_pool: usize,
    #[arg(long, default_value = "80")]
    warp_size: usize,
    #[arg(long, default_value_t = false)]
    keep_color: bool,
    #[arg(long, default_value = "4")]
    stack: usize,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Play(args) => play(args),
        Commands::Eval(args) => eval(args),
        Commands::Baseline(args) => baseline(args),
    };
    if let Err(err) = &result {
        if err.is::<WindowClosed>() {
            eprintln!("\nRender window closed. Exiting.");
            return Ok(());
        }
    }
    result
}
