mod synthetic;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;
use voice_state_core::arbiter::{DetectionMode, DeviceResourceState, PerformanceMode};
use voice_state_core::capture::{CaptureDevice, ScriptedCaptureDevice};
use voice_state_core::config::{
    resolve_optional_string, resolve_parsed_with_default, DetectionConfig, EngineConfig, Env,
    SamplingConfig, StdEnv, DEFAULT_LONG_PAUSE_MS, DEFAULT_SHORT_PAUSE_MS,
    DEFAULT_VOLUME_THRESHOLD, ENV_INPUT_DEVICE, ENV_LONG_PAUSE_MS, ENV_SHORT_PAUSE_MS,
    ENV_VOLUME_THRESHOLD,
};
use voice_state_core::emotion::classify_text;
use voice_state_core::resources::{
    FixedResources, ResourceMonitor, SysfsBatteryMonitor, DEFAULT_POLL_INTERVAL,
};
use voice_state_core::session::{EngineEvent, SessionError};
use voice_state_core::util::{retry_with_backoff, RetryConfig};
use voice_state_core::VoiceStateEngine;

const SYNTHETIC_SAMPLE_RATE: u32 = 16_000;
const SYNTHETIC_BINS: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "voice-state")]
#[command(about = "Real-time emotion and turn-completion detection from microphone input")]
struct Args {
    /// Use a generated voice signal instead of a microphone
    #[arg(long)]
    synthetic: bool,

    /// Seed for --synthetic
    #[arg(long)]
    seed: Option<u64>,

    /// Input device name (default: system default input)
    #[arg(long)]
    input_device: Option<String>,

    #[arg(long)]
    short_pause_ms: Option<u64>,

    #[arg(long)]
    long_pause_ms: Option<u64>,

    #[arg(long)]
    volume_threshold: Option<f32>,

    #[arg(long)]
    no_context_analysis: bool,

    #[arg(long, value_enum, default_value_t = ModeArg::Emotion)]
    mode: ModeArg,

    /// Keep --mode regardless of battery and performance readings
    #[arg(long)]
    no_auto_switch: bool,

    /// Read battery state from /sys/class/power_supply
    #[arg(long, conflicts_with = "battery_level")]
    sysfs_battery: bool,

    /// Fixed battery level in [0, 1]
    #[arg(long)]
    battery_level: Option<f32>,

    #[arg(long)]
    charging: bool,

    #[arg(long, value_enum, default_value_t = PerformanceArg::Balanced)]
    performance_mode: PerformanceArg,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Attempts at acquiring a busy or missing device
    #[arg(long, default_value_t = 3)]
    acquire_attempts: u32,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Emotion,
    Motion,
    Both,
    BatterySaver,
}

impl From<ModeArg> for DetectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Emotion => DetectionMode::Emotion,
            ModeArg::Motion => DetectionMode::Motion,
            ModeArg::Both => DetectionMode::Both,
            ModeArg::BatterySaver => DetectionMode::BatterySaver,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PerformanceArg {
    High,
    Balanced,
    BatterySaver,
}

impl From<PerformanceArg> for PerformanceMode {
    fn from(mode: PerformanceArg) -> Self {
        match mode {
            PerformanceArg::High => PerformanceMode::High,
            PerformanceArg::Balanced => PerformanceMode::Balanced,
            PerformanceArg::BatterySaver => PerformanceMode::BatterySaver,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let config = build_config(&args, &env)?;

    tracing::info!(
        short_pause_ms = config.detection.short_pause_ms(),
        long_pause_ms = config.detection.long_pause_ms(),
        volume_threshold = config.detection.volume_threshold(),
        mode = %config.initial_mode,
        auto_switch = config.auto_switch,
        "config loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let input_device = resolve_optional_string(args.input_device.clone(), ENV_INPUT_DEVICE, &env);

    let (device, script) = if args.synthetic {
        let (device, controller) = ScriptedCaptureDevice::new(SYNTHETIC_SAMPLE_RATE, SYNTHETIC_BINS);
        (Arc::new(device) as Arc<dyn CaptureDevice>, Some(controller))
    } else {
        (microphone(input_device)?, None)
    };

    let engine = VoiceStateEngine::new(device, config);

    let monitor = resource_monitor(&args);
    match monitor.current() {
        Ok(state) => {
            engine.update_resources(state);
        }
        Err(e) => tracing::warn!(error = %e, "initial resource reading failed"),
    }
    if engine.recommended_mode() != engine.mode() {
        tracing::info!(
            current = %engine.mode(),
            recommended = %engine.recommended_mode(),
            "a different detection mode is recommended for this device"
        );
    }
    let resource_task = engine.watch_resources(monitor, DEFAULT_POLL_INTERVAL, shutdown_rx.clone());

    let retry = RetryConfig::new(args.acquire_attempts, Duration::from_millis(500));
    let mut session = retry_with_backoff(&retry, || engine.start(), |e| match e {
        SessionError::Capture(c) => c.is_transient(),
        SessionError::Motion(_) => false,
    })
    .await
    .context("failed to start detection session")?;
    let mut events = session.subscribe();

    let script_task = script.map(|controller| {
        tokio::spawn(synthetic::drive(
            controller,
            engine.transcript(),
            args.seed,
            shutdown_rx.clone(),
        ))
    });
    let stdin_task = tokio::spawn(read_transcript(engine.clone(), shutdown_rx.clone()));

    let deadline = args.duration_secs.map(Duration::from_secs);
    let run = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_event(&event)?;
                    if matches!(event, EngineEvent::Error { .. }) {
                        return anyhow::Ok(Outcome::SessionFailed);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event consumer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(Outcome::Finished),
            }
        }
    };

    let outcome = tokio::select! {
        res = run => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Outcome::Finished
        }
        _ = sleep_for(deadline) => {
            tracing::info!("duration elapsed");
            Outcome::Finished
        }
    };

    let _ = shutdown_tx.send(true);
    session.stop().await;
    while let Ok(event) = events.try_recv() {
        print_event(&event)?;
    }

    if let Some(task) = script_task {
        let _ = task.await;
    }
    let _ = resource_task.await;
    stdin_task.abort();

    // a blocking stdin read cannot be cancelled and would hold up runtime
    // shutdown until the next line arrives
    std::process::exit(outcome.exit_code())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Finished,
    /// The session reported a fatal error such as a lost device.
    SessionFailed,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Finished => 0,
            Outcome::SessionFailed => 1,
        }
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Each stdin line is a transcribed fragment: appended to the transcript and
/// scored by the text classifier.
async fn read_transcript(
    engine: VoiceStateEngine,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let transcript = engine.transcript();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                transcript.append(line);
                let sample = classify_text(line);
                println!(
                    "{}",
                    json!({ "type": "text_emotion", "text": line, "sample": sample })
                );
            }
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}

fn print_event(event: &EngineEvent) -> anyhow::Result<()> {
    let line = serde_json::to_string(event).context("failed to serialize event")?;
    println!("{line}");
    Ok(())
}

#[cfg(feature = "device-capture")]
fn microphone(input_device: Option<String>) -> anyhow::Result<Arc<dyn CaptureDevice>> {
    use voice_state_core::capture::CpalCaptureDevice;

    let device = match input_device {
        Some(name) => CpalCaptureDevice::new().with_input_device_name(name),
        None => CpalCaptureDevice::new(),
    };
    Ok(Arc::new(device))
}

#[cfg(not(feature = "device-capture"))]
fn microphone(_input_device: Option<String>) -> anyhow::Result<Arc<dyn CaptureDevice>> {
    anyhow::bail!("built without microphone support; rerun with --synthetic")
}

fn resource_monitor(args: &Args) -> Arc<dyn ResourceMonitor> {
    if args.sysfs_battery {
        return Arc::new(SysfsBatteryMonitor::new());
    }
    Arc::new(FixedResources::new(DeviceResourceState::new(
        args.battery_level.unwrap_or(1.0),
        args.charging,
        args.performance_mode.into(),
    )))
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    // stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(args: &Args, env: &impl Env) -> anyhow::Result<EngineConfig> {
    let short_pause_ms = resolve_parsed_with_default(
        args.short_pause_ms,
        ENV_SHORT_PAUSE_MS,
        env,
        DEFAULT_SHORT_PAUSE_MS,
    )?;
    let long_pause_ms =
        resolve_parsed_with_default(args.long_pause_ms, ENV_LONG_PAUSE_MS, env, DEFAULT_LONG_PAUSE_MS)?;
    let volume_threshold = resolve_parsed_with_default(
        args.volume_threshold,
        ENV_VOLUME_THRESHOLD,
        env,
        DEFAULT_VOLUME_THRESHOLD,
    )?;

    let detection = DetectionConfig::new(
        short_pause_ms,
        long_pause_ms,
        volume_threshold,
        !args.no_context_analysis,
    )?;

    Ok(EngineConfig {
        detection,
        sampling: SamplingConfig::default(),
        auto_switch: !args.no_auto_switch,
        initial_mode: args.mode.into(),
    })
}
