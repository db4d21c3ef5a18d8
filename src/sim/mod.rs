//! 模拟采集 / 渲染设备
//!
//! 两个线程各自按自己的时钟周期性调用端口，模拟两台独立的音频设备：
//! - 起始采样时间、周期长度、启动时刻都可以不同
//! - 渲染时钟可以有 ppm 级速率偏差，用于观察漂移
//! - 每次回调的唤醒时刻带随机抖动
//!
//! 采集端写入的是测试标记：每个样本编码自身的输入采样时间，
//! 渲染端据此检查输出是否连续、声道之间是否撕裂。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio::{
    AlignState, ConfigError, FrameBlock, FrameBlockMut, FrameLayout, SampleFormat, SampleTime,
    StatsReport, StreamFormat,
};
use crate::engine::{EngineError, InputPort, OutputPort, PlayThrough, RelayConfig};

/// 模拟设备支持的最大 buffer 数（非交织布局下即声道数）
pub const MAX_SIM_CHANNELS: usize = 16;

/// 剩余时间超过该值时睡眠，否则自旋 / yield
const SLEEP_THRESHOLD: Duration = Duration::from_micros(1500);

/// 控制线程检查取消标志的间隔
const CONTROL_POLL: Duration = Duration::from_millis(20);

/// 模拟配置
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// 运行时长
    pub duration: Duration,
    /// 采集设备周期（帧）
    pub input_period: u32,
    /// 渲染设备周期（帧）
    pub output_period: u32,
    /// 采集设备第一次回调的采样时间
    pub input_start_time: SampleTime,
    /// 渲染设备第一次回调的采样时间
    pub output_start_time: SampleTime,
    /// 渲染设备相对采集设备的启动延迟（可为负：渲染先启动）
    pub output_delay_us: i64,
    /// 渲染时钟速率偏差（ppm，正值表示渲染时钟更快）
    pub drift_ppm: f64,
    /// 每次回调唤醒的最大随机延迟
    pub jitter_us: u64,
    /// 随机种子；None 时使用系统熵
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            input_period: 512,
            output_period: 512,
            input_start_time: 0,
            output_start_time: 0,
            output_delay_us: 3_000,
            drift_ppm: 0.0,
            jitter_us: 300,
            seed: None,
        }
    }
}

impl SimConfig {
    /// 检查模拟参数是否适合给定的中继配置
    pub fn validate(&self, relay: &RelayConfig) -> Result<(), ConfigError> {
        if self.input_period == 0 || self.output_period == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        let capacity = relay.capacity_frames();
        for period in [self.input_period, self.output_period] {
            if period as u64 > capacity {
                return Err(ConfigError::PeriodExceedsCapacity { period, capacity });
            }
        }
        if relay.format.buffer_count() > MAX_SIM_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                channels: relay.format.channels,
                max: MAX_SIM_CHANNELS,
            });
        }
        Ok(())
    }
}

/// 测试标记编码
///
/// 标记值 = `t mod period + 1`，永远非零，所以全零样本就是静音
struct Marker {
    format: SampleFormat,
}

impl Marker {
    fn period(&self) -> i64 {
        match self.format {
            SampleFormat::I16 => i16::MAX as i64,
            SampleFormat::I32 => i32::MAX as i64,
            // f32 能精确表示 2^24 以内的整数
            SampleFormat::F32 => 1 << 24,
        }
    }

    fn value(&self, time: SampleTime) -> i64 {
        time.rem_euclid(self.period()) + 1
    }

    /// 标记值的后继
    fn next(&self, value: i64) -> i64 {
        value % self.period() + 1
    }

    fn write(&self, value: i64, out: &mut [u8]) {
        match self.format {
            SampleFormat::I16 => out.copy_from_slice(&(value as i16).to_ne_bytes()),
            SampleFormat::I32 => out.copy_from_slice(&(value as i32).to_ne_bytes()),
            SampleFormat::F32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
        }
    }

    fn read(&self, bytes: &[u8]) -> i64 {
        match self.format {
            SampleFormat::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as i64,
            SampleFormat::I32 => {
                i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
            }
            SampleFormat::F32 => {
                f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
            }
        }
    }
}

/// 渲染端的输出检查
#[derive(Debug, Clone, Default)]
pub struct SignalCheck {
    /// 含标记的帧
    pub audible_frames: u64,
    /// 静音帧
    pub silent_frames: u64,
    /// 相邻两个有声帧的标记不连续
    pub discontinuities: u64,
    /// 同一帧内各声道标记不一致
    pub torn_frames: u64,
    last: Option<i64>,
}

impl SignalCheck {
    fn inspect(&mut self, format: &StreamFormat, buffers: &[Vec<u8>], frames: usize) {
        let marker = Marker {
            format: format.sample_format,
        };
        let bps = format.bytes_per_sample();
        let slot = format.bytes_per_slot();
        let samples_per_slot = slot / bps;

        for frame in 0..frames {
            let mut first = None;
            let mut torn = false;
            for buffer in buffers {
                for ch in 0..samples_per_slot {
                    let offset = frame * slot + ch * bps;
                    let value = marker.read(&buffer[offset..offset + bps]);
                    match first {
                        None => first = Some(value),
                        Some(v) if v != value => torn = true,
                        Some(_) => {}
                    }
                }
            }

            if torn {
                self.torn_frames += 1;
            }
            match first {
                Some(0) | None => {
                    self.silent_frames += 1;
                    self.last = None;
                }
                Some(value) => {
                    self.audible_frames += 1;
                    if let Some(last) = self.last {
                        if marker.next(last) != value {
                            self.discontinuities += 1;
                        }
                    }
                    self.last = Some(value);
                }
            }
        }
    }
}

/// 模拟结果
#[derive(Debug, Clone)]
pub struct SimSummary {
    pub elapsed: Duration,
    pub input_callbacks: u64,
    pub output_callbacks: u64,
    pub align_state: AlignState,
    pub offset: Option<SampleTime>,
    pub signal: SignalCheck,
    pub report: StatsReport,
}

impl SimSummary {
    /// 对齐之后是否有任何数据错误（撕裂或错位）
    pub fn is_clean(&self) -> bool {
        self.signal.torn_frames == 0 && self.report.contract_violations == 0
    }
}

impl fmt::Display for SimSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulation ({:.2}s)", self.elapsed.as_secs_f64())?;
        writeln!(f, "==========")?;
        writeln!(f, "Input callbacks: {}", self.input_callbacks)?;
        writeln!(f, "Output callbacks: {}", self.output_callbacks)?;
        match self.offset {
            Some(offset) => writeln!(f, "Clock alignment: {} (offset {:+} frames)", self.align_state, offset)?,
            None => writeln!(f, "Clock alignment: {}", self.align_state)?,
        }
        writeln!(f, "Audible frames: {}", self.signal.audible_frames)?;
        writeln!(f, "Silent frames: {}", self.signal.silent_frames)?;
        writeln!(f, "Discontinuities: {}", self.signal.discontinuities)?;
        writeln!(f, "Torn frames: {}", self.signal.torn_frames)?;
        writeln!(f)?;
        write!(f, "{}", self.report)
    }
}

/// 单个模拟设备的时钟
struct DeviceClock {
    epoch: Instant,
    period: Duration,
    start_time: SampleTime,
    period_frames: u32,
}

impl DeviceClock {
    fn new(
        epoch: Instant,
        format: &StreamFormat,
        period_frames: u32,
        start_time: SampleTime,
        drift_ppm: f64,
    ) -> Self {
        let nominal = format.frames_to_ns(period_frames as u64) as f64;
        let period = Duration::from_nanos((nominal / (1.0 + drift_ppm / 1_000_000.0)) as u64);
        Self {
            epoch,
            period,
            start_time,
            period_frames,
        }
    }

    /// 第 n 次回调的唤醒时刻
    fn deadline(&self, n: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(n as u128);
        let offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        // 超出 Instant 范围时立即回调
        self.epoch.checked_add(offset).unwrap_or_else(Instant::now)
    }

    /// 第 n 次回调的采样时间
    fn sample_time(&self, n: u64) -> SampleTime {
        let frames = i64::try_from(n)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.period_frames as i64);
        self.start_time.saturating_add(frames)
    }
}

/// 等待到指定时刻
///
/// 长等待睡眠，最后一小段用 Backoff 自旋 / yield
fn wait_until(deadline: Instant) {
    let backoff = Backoff::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SLEEP_THRESHOLD {
            thread::sleep(remaining - SLEEP_THRESHOLD / 2);
        } else {
            backoff.snooze();
        }
    }
}

fn jitter(rng: &mut StdRng, max_us: u64) -> Duration {
    if max_us == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(rng.gen_range(0..=max_us))
    }
}

fn make_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

fn device_buffers(format: &StreamFormat, period_frames: u32) -> Vec<Vec<u8>> {
    let len = period_frames as usize * format.bytes_per_slot();
    (0..format.buffer_count()).map(|_| vec![0u8; len]).collect()
}

/// 采集线程主函数
///
/// 所有 buffer 在循环前分配，循环内只写标记和调用端口
fn capture_thread_main(
    mut port: InputPort,
    format: StreamFormat,
    clock: DeviceClock,
    jitter_us: u64,
    mut rng: StdRng,
) -> u64 {
    let marker = Marker {
        format: format.sample_format,
    };
    let frames = clock.period_frames as usize;
    let bps = format.bytes_per_sample();
    let mut buffers = device_buffers(&format, clock.period_frames);
    let mut callbacks = 0u64;

    log::info!(
        "Capture thread started: {} frames/period, first sample time {}",
        frames,
        clock.start_time
    );

    while port.is_running() {
        wait_until(clock.deadline(callbacks) + jitter(&mut rng, jitter_us));
        let time = clock.sample_time(callbacks);

        for buffer in buffers.iter_mut() {
            for (i, slot) in buffer.chunks_exact_mut(bps).enumerate() {
                let frame = (i * bps / format.bytes_per_slot()) as i64;
                marker.write(marker.value(time + frame), slot);
            }
        }

        match format.layout {
            FrameLayout::Interleaved => {
                port.on_input(FrameBlock::Interleaved(&buffers[0]), frames, time);
            }
            FrameLayout::NonInterleaved => {
                let mut refs: [&[u8]; MAX_SIM_CHANNELS] = Default::default();
                for (r, buffer) in refs.iter_mut().zip(buffers.iter()) {
                    *r = buffer.as_slice();
                }
                port.on_input(
                    FrameBlock::NonInterleaved(&refs[..buffers.len()]),
                    frames,
                    time,
                );
            }
        }
        callbacks += 1;
    }

    log::info!("Capture thread finished after {} callbacks", callbacks);
    callbacks
}

/// 渲染线程主函数
fn render_thread_main(
    mut port: OutputPort,
    format: StreamFormat,
    clock: DeviceClock,
    jitter_us: u64,
    mut rng: StdRng,
) -> (u64, SignalCheck) {
    let frames = clock.period_frames as usize;
    let mut buffers = device_buffers(&format, clock.period_frames);
    let mut check = SignalCheck::default();
    let mut callbacks = 0u64;

    log::info!(
        "Render thread started: {} frames/period, first sample time {}",
        frames,
        clock.start_time
    );

    while port.is_running() {
        wait_until(clock.deadline(callbacks) + jitter(&mut rng, jitter_us));
        let time = clock.sample_time(callbacks);

        match format.layout {
            FrameLayout::Interleaved => {
                port.on_output(
                    &mut FrameBlockMut::Interleaved(&mut buffers[0]),
                    frames,
                    time,
                );
            }
            FrameLayout::NonInterleaved => {
                let count = buffers.len();
                let mut refs: [&mut [u8]; MAX_SIM_CHANNELS] = Default::default();
                for (r, buffer) in refs.iter_mut().zip(buffers.iter_mut()) {
                    *r = buffer.as_mut_slice();
                }
                port.on_output(
                    &mut FrameBlockMut::NonInterleaved(&mut refs[..count]),
                    frames,
                    time,
                );
            }
        }

        check.inspect(&format, &buffers, frames);
        callbacks += 1;
    }

    log::info!("Render thread finished after {} callbacks", callbacks);
    (callbacks, check)
}

/// 运行模拟
///
/// 取出会话的两个端口，在 `capture` / `render` 两个线程上驱动，
/// 到时或 `cancel` 被置位后按顺序停止两端并汇总结果。
pub fn run(
    session: &mut PlayThrough,
    config: &SimConfig,
    cancel: &AtomicBool,
) -> Result<SimSummary, EngineError> {
    config.validate(session.config())?;
    let format = session.config().format;

    let input = session.input_port()?;
    let output = session.output_port()?;

    let started = Instant::now();
    // 负延迟表示渲染设备先启动
    let delay = Duration::from_micros(config.output_delay_us.unsigned_abs());
    let (input_epoch, output_epoch) = if config.output_delay_us >= 0 {
        (started, started + delay)
    } else {
        (started + delay, started)
    };

    let capture_clock = DeviceClock::new(
        input_epoch,
        &format,
        config.input_period,
        config.input_start_time,
        0.0,
    );
    let render_clock = DeviceClock::new(
        output_epoch,
        &format,
        config.output_period,
        config.output_start_time,
        config.drift_ppm,
    );

    log::info!(
        "Simulating {:.1}s: input period {} @ t={}, output period {} @ t={}, output delay {}µs, drift {:+.1}ppm, jitter ≤{}µs",
        config.duration.as_secs_f64(),
        config.input_period,
        config.input_start_time,
        config.output_period,
        config.output_start_time,
        config.output_delay_us,
        config.drift_ppm,
        config.jitter_us
    );

    let jitter_us = config.jitter_us;
    let capture_rng = make_rng(config.seed, 1);
    let render_rng = make_rng(config.seed, 2);

    let capture: JoinHandle<u64> = thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || capture_thread_main(input, format, capture_clock, jitter_us, capture_rng))
        .map_err(|source| EngineError::Spawn {
            name: "capture",
            source,
        })?;

    let render = thread::Builder::new()
        .name("render".to_string())
        .spawn(move || render_thread_main(output, format, render_clock, jitter_us, render_rng));
    let render: JoinHandle<(u64, SignalCheck)> = match render {
        Ok(handle) => handle,
        Err(source) => {
            session.stop_input()?;
            let _ = capture.join();
            return Err(EngineError::Spawn {
                name: "render",
                source,
            });
        }
    };

    let deadline = started + config.duration;
    while !cancel.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(CONTROL_POLL));
    }
    if cancel.load(Ordering::Acquire) {
        log::info!("Simulation cancelled");
    }

    session.stop_input()?;
    let input_callbacks = capture
        .join()
        .map_err(|_| EngineError::ThreadPanicked("capture"))?;

    session.stop_output()?;
    let (output_callbacks, signal) = render
        .join()
        .map_err(|_| EngineError::ThreadPanicked("render"))?;

    let summary = SimSummary {
        elapsed: started.elapsed(),
        input_callbacks,
        output_callbacks,
        align_state: session.align_state(),
        offset: session.offset(),
        signal,
        report: session.report(),
    };

    if summary.signal.discontinuities > 0 || summary.report.has_glitches() {
        log::warn!(
            "Relay glitched: {} discontinuities, {} underrun / {} overrun / {} overwritten frames",
            summary.signal.discontinuities,
            summary.report.underrun_frames,
            summary.report.overrun_frames,
            summary.report.overwritten_frames
        );
    }

    Ok(summary)
}
