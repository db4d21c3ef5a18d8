//! Playthrough - 实时音频直通中继
//!
//! 把一台设备采集到的音频实时转发到另一台时钟独立的设备：
//! - 按采样时间寻址的 lock-free ring buffer
//! - 首次回调时对齐两个时钟
//! - 实时路径零锁、零分配、零日志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use playthrough::audio::{FrameLayout, SampleFormat, StreamFormat, DEFAULT_BUFFER_PERIODS};
use playthrough::engine::{PlayThrough, RelayConfig};
use playthrough::sim::{self, SimConfig};

/// Playthrough - Real-time audio relay between independently clocked devices
#[derive(Parser)]
#[command(name = "playthrough")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show relay sizing for the given stream configuration
    Info {
        #[command(flatten)]
        relay: RelayArgs,
    },

    /// Relay between two simulated devices and report the result
    Simulate {
        #[command(flatten)]
        relay: RelayArgs,

        #[command(flatten)]
        sim: SimArgs,
    },
}

/// 中继参数
#[derive(Args, Debug)]
struct RelayArgs {
    /// Sample rate in Hz
    #[arg(long, default_value = "48000")]
    rate: u32,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: u16,

    /// Sample format: i16, i32 or f32
    #[arg(long, default_value = "f32")]
    sample_format: SampleFormat,

    /// Frame layout: interleaved or non-interleaved
    #[arg(long, default_value = "non-interleaved")]
    layout: FrameLayout,

    /// Device period in frames
    #[arg(short, long, default_value = "512")]
    period: u32,

    /// Ring buffer capacity in device periods
    #[arg(long, default_value_t = DEFAULT_BUFFER_PERIODS)]
    buffer_periods: u32,

    /// Extra render latency in frames (defaults to one period)
    #[arg(long)]
    safety_offset: Option<u32>,

    /// Lock ring buffer memory (mlock)
    #[arg(long)]
    lock_memory: bool,
}

impl RelayArgs {
    fn to_config(&self) -> RelayConfig {
        RelayConfig {
            format: StreamFormat::new(self.rate, self.channels, self.sample_format)
                .with_layout(self.layout),
            period_frames: self.period,
            buffer_periods: self.buffer_periods,
            safety_offset_frames: self.safety_offset.unwrap_or(self.period),
            lock_memory: self.lock_memory,
        }
    }
}

/// 模拟参数
#[derive(Args, Debug)]
struct SimArgs {
    /// Run time in seconds
    #[arg(short, long, default_value = "5")]
    seconds: f64,

    /// Render device period in frames (defaults to the capture period)
    #[arg(long)]
    output_period: Option<u32>,

    /// Sample time of the first capture callback
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    input_start: i64,

    /// Sample time of the first render callback
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    output_start: i64,

    /// Render device start delay in microseconds (negative: render starts first)
    #[arg(long, default_value = "3000", allow_hyphen_values = true)]
    output_delay_us: i64,

    /// Render clock rate error in ppm
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    drift_ppm: f64,

    /// Maximum callback wake-up jitter in microseconds
    #[arg(long, default_value = "300")]
    jitter_us: u64,

    /// Random seed for reproducible jitter
    #[arg(long)]
    seed: Option<u64>,
}

impl SimArgs {
    fn to_config(&self, relay: &RelayConfig) -> anyhow::Result<SimConfig> {
        let duration = Duration::try_from_secs_f64(self.seconds)
            .map_err(|e| anyhow::anyhow!("invalid duration {}s: {}", self.seconds, e))?;
        Ok(SimConfig {
            duration,
            input_period: relay.period_frames,
            output_period: self.output_period.unwrap_or(relay.period_frames),
            input_start_time: self.input_start,
            output_start_time: self.output_start,
            output_delay_us: self.output_delay_us,
            drift_ppm: self.drift_ppm,
            jitter_us: self.jitter_us,
            seed: self.seed,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Info { ref relay } => show_info(&relay.to_config())?,
        Commands::Simulate { ref relay, ref sim } => {
            let relay = relay.to_config();
            let sim = sim.to_config(&relay)?;
            simulate(relay, &sim)?;
        }
    }

    Ok(())
}

/// 显示中继尺寸
fn show_info(config: &RelayConfig) -> anyhow::Result<()> {
    config.validate()?;

    let format = &config.format;
    let capacity = config.capacity_frames();
    let ms = |frames: u64| format.frames_to_ns(frames) as f64 / 1_000_000.0;

    println!("Playthrough Relay");
    println!("=================");
    println!("Format: {}", format);
    println!(
        "Device period: {} frames ({:.2}ms)",
        config.period_frames,
        ms(config.period_frames as u64)
    );
    println!(
        "Ring capacity: {} frames ({:.2}ms, {} periods)",
        capacity,
        ms(capacity),
        config.buffer_periods
    );
    println!(
        "Ring storage: {} buffer(s) x {} bytes",
        format.buffer_count(),
        capacity as usize * format.bytes_per_slot()
    );
    println!(
        "Added render latency: {} frames ({:.2}ms)",
        config.safety_offset_frames,
        config.latency_ms()
    );
    println!(
        "Jitter headroom: {} frames ({:.2}ms)",
        capacity - config.safety_offset_frames as u64 - config.period_frames as u64,
        ms(capacity - config.safety_offset_frames as u64 - config.period_frames as u64)
    );

    Ok(())
}

/// 运行模拟
fn simulate(relay: RelayConfig, sim_config: &SimConfig) -> anyhow::Result<()> {
    let mut session = PlayThrough::new(relay)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        c.store(true, Ordering::SeqCst);
    })?;

    println!("Playthrough - Simulated Devices");
    println!("Press Ctrl+C to stop.\n");

    let summary = sim::run(&mut session, sim_config, &cancel)?;
    println!("{}", summary);

    if !summary.is_clean() {
        anyhow::bail!(
            "relay produced corrupted output ({} torn frames, {} contract violations)",
            summary.signal.torn_frames,
            summary.report.contract_violations
        );
    }

    Ok(())
}
