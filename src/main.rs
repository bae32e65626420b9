use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use darktower_lib::codec;
use darktower_lib::composer::{DrumPatch, StatePatch, compose_patch};
use darktower_lib::message::{self, MessageKind};
use darktower_lib::sim::{SimOptions, SimulatedTower};
use darktower_lib::state::{AudioState, Compass, DrumLevel, LightEffect, LightLayer, LightSequence, LightState, Seal};
use darktower_lib::{DarkTower, TowerConfig, TowerEvent};

/// Frame decoder, encoder and simulator for the Return to Dark Tower tower.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify and decode hex-encoded frames
    Decode {
        /// One or more frames, e.g. 07000010cc
        #[arg(required = true)]
        frames: Vec<String>,
        /// Print decoded state reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build a state command against a neutral tower and print it as hex
    Encode {
        /// Light as layer:slot:effect[:loop], e.g. top:0:breathefast:loop
        #[arg(long = "light", value_parser = parse_light)]
        lights: Vec<(LightLayer, usize, LightState)>,
        /// Drum rotation as level:direction, e.g. middle:west
        #[arg(long = "rotate", value_parser = parse_rotation)]
        rotations: Vec<(DrumLevel, Compass)>,
        /// Sound sample index (0-127)
        #[arg(long)]
        sound: Option<u8>,
        /// Sound volume (0-15)
        #[arg(long, default_value_t = 0)]
        volume: u8,
        /// LED sequence override
        #[arg(long)]
        sequence: Option<u8>,
    },
    /// Drive the controller against a simulated tower
    Simulate {
        /// JSON file with controller settings
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Seconds to keep running after the script finishes
        #[arg(short, long, default_value_t = 5)]
        linger: u64,
    },
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv; RUST_LOG still wins
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let result = match cli.command {
        Command::Decode { frames, json } => decode(&frames, json),
        Command::Encode {
            lights,
            rotations,
            sound,
            volume,
            sequence,
        } => encode(lights, rotations, sound, volume, sequence),
        Command::Simulate { config, linger } => simulate(config, linger).await,
    };

    if let Err(e) = result {
        error!("{:?}", e);
        process::exit(1);
    }
    Ok(())
}

fn decode(frames: &[String], json: bool) -> Result<()> {
    for text in frames {
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
        let frame = Bytes::from(hex::decode(&cleaned).with_context(|| format!("Invalid hex frame: {}", text))?);

        let lines = message::render_human_readable(&frame);
        println!("{}", lines.join("\n  "));

        if json && message::is_state_frame(&frame) {
            let state = codec::decode_state_frame(&frame)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        } else if message::classify_frame(&frame).is_some_and(|c| c.kind == MessageKind::TowerState)
            && !message::is_state_frame(&frame)
        {
            warn!(len = frame.len(), "State report is shorter than a full payload");
        }
    }
    Ok(())
}

fn encode(
    lights: Vec<(LightLayer, usize, LightState)>,
    rotations: Vec<(DrumLevel, Compass)>,
    sound: Option<u8>,
    volume: u8,
    sequence: Option<u8>,
) -> Result<()> {
    let mut patch = StatePatch::new();
    for (layer, slot, light) in lights {
        patch = patch.light(layer, slot, light);
    }
    for (level, position) in rotations {
        patch = patch.drum(level, DrumPatch::rotate(position, false));
    }
    if let Some(sample) = sound {
        patch = patch.audio(AudioState {
            sample,
            looped: false,
            volume,
        });
    }
    if let Some(sequence) = sequence {
        patch = patch.led_sequence(sequence);
    }
    if patch.is_empty() {
        bail!("Nothing to encode; pass at least one of --light, --rotate, --sound, --sequence");
    }

    let composed = compose_patch(None, &patch)?;
    println!("{}", hex::encode(&composed.frame));
    Ok(())
}

async fn simulate(config_path: Option<PathBuf>, linger: u64) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read config: {:?}", path))?;
            TowerConfig::from_json(&text).with_context(|| format!("Invalid config: {:?}", path))?
        }
        None => TowerConfig::default(),
    };

    let sim = SimulatedTower::new(SimOptions::default());
    let tower = DarkTower::new(sim.clone(), config);
    let mut events = tower.subscribe();

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TowerEvent::StateChanged(state)) => println!("state    {}", state),
                Ok(TowerEvent::Message { lines, .. }) => println!("message  {}", lines.join(" | ")),
                Ok(other) => println!("event    {:?}", other),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tower.connect().await?;
    if !tower.is_connected() {
        bail!("Simulated tower did not connect");
    }
    if let Some(info) = tower.device_info() {
        info!(?info, "Device information");
    }

    tokio::select! {
        result = run_script(&tower, &sim) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping");
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(linger)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    println!("{}", serde_json::to_string_pretty(&tower.connection_status())?);
    tower.dispose().await;
    printer.abort();
    Ok(())
}

/// A short game turn: calibrate, light up, turn drums, break a seal, drop skulls.
async fn run_script(tower: &DarkTower<SimulatedTower>, sim: &SimulatedTower) -> Result<()> {
    tower.calibrate().await?;
    tower.set_led_sequence(LightSequence::MonthStarted).await?;
    tower.play_sound(0x15, false, 3).await?;
    tower.set_led(LightLayer::Ledge, 1, LightEffect::Breathe, true).await?;
    tower.rotate(Compass::East, Compass::South, Compass::West, true).await?;
    tower.random_rotate(&[DrumLevel::Top, DrumLevel::Bottom]).await?;
    tower.break_seal(Seal::new(DrumLevel::Middle, Compass::North)).await?;

    for _ in 0..2 {
        sim.drop_skull();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    tower.reset_skull_counter().await?;
    info!(seals = ?tower.broken_seals(), "Script finished");
    Ok(())
}

fn parse_layer(s: &str) -> Result<LightLayer> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "top" | "0" => LightLayer::TopRing,
        "middle" | "1" => LightLayer::MiddleRing,
        "bottom" | "2" => LightLayer::BottomRing,
        "ledge" | "3" => LightLayer::Ledge,
        "base1" | "4" => LightLayer::Base1,
        "base2" | "5" => LightLayer::Base2,
        other => bail!("Unknown light layer: {}", other),
    })
}

fn parse_level(s: &str) -> Result<DrumLevel> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "top" | "0" => DrumLevel::Top,
        "middle" | "1" => DrumLevel::Middle,
        "bottom" | "2" => DrumLevel::Bottom,
        other => bail!("Unknown drum level: {}", other),
    })
}

fn parse_compass(s: &str) -> Result<Compass> {
    Compass::ALL
        .into_iter()
        .find(|c| c.to_string().eq_ignore_ascii_case(s))
        .with_context(|| format!("Unknown direction: {}", s))
}

fn parse_effect(s: &str) -> Result<LightEffect> {
    if let Ok(code) = s.parse::<u8>() {
        if code > 7 {
            bail!("Light effect code out of range: {}", code);
        }
        return Ok(LightEffect::from(code));
    }
    (0..=7u8)
        .map(LightEffect::from)
        .find(|e| e.to_string().eq_ignore_ascii_case(s) || format!("{:?}", e).eq_ignore_ascii_case(s))
        .with_context(|| format!("Unknown light effect: {}", s))
}

fn parse_light(s: &str) -> Result<(LightLayer, usize, LightState)> {
    let parts: Vec<&str> = s.split(':').collect();
    let (layer, slot, effect, looped) = match parts.as_slice() {
        [layer, slot, effect] => (layer, slot, effect, false),
        [layer, slot, effect, "loop"] => (layer, slot, effect, true),
        _ => bail!("Expected layer:slot:effect[:loop], got {}", s),
    };
    let slot: usize = slot.parse().with_context(|| format!("Invalid slot: {}", slot))?;
    Ok((parse_layer(layer)?, slot, LightState::new(parse_effect(effect)?, looped)))
}

fn parse_rotation(s: &str) -> Result<(DrumLevel, Compass)> {
    let Some((level, direction)) = s.split_once(':') else {
        bail!("Expected level:direction, got {}", s);
    };
    Ok((parse_level(level)?, parse_compass(direction)?))
}
