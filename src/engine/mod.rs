//! 直通会话
//!
//! 整合 ring buffer、时钟对齐器和统计
//! 核心设计：采集回调和渲染回调完全解耦，通过按采样时间寻址的 ring buffer 连接。
//! 两个回调各自持有一个端口（`InputPort` / `OutputPort`），
//! 会话本身留在控制线程上，负责建立、两阶段停止和报告。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use thiserror::Error;

use crate::audio::{
    AlignState, ClockAligner, ConfigError, FrameBlock, FrameBlockMut, SampleTime, StatsReport,
    StreamFormat, TimeRingBuffer, DEFAULT_BUFFER_PERIODS,
};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 两个端口都在工作
    Running,
    /// 采集端已停止，渲染端仍在输出
    InputStopped,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::InputStopped => f.write_str("input stopped"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// 中继配置
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// 两端共用的流格式
    pub format: StreamFormat,
    /// 设备周期（帧），决定 ring buffer 容量
    pub period_frames: u32,
    /// ring buffer 容量 = period_frames * buffer_periods
    pub buffer_periods: u32,
    /// 渲染端相对对齐时间额外滞后的帧数
    /// 用来吸收两个回调之间的相位差和调度抖动，代价是同等的延迟
    pub safety_offset_frames: u32,
    /// 是否 mlock ring buffer 存储
    pub lock_memory: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            period_frames: 512,
            buffer_periods: DEFAULT_BUFFER_PERIODS,
            // 一个周期：输出先启动时，读到的正好是上一周期已写完的数据
            safety_offset_frames: 512,
            lock_memory: false,
        }
    }
}

impl RelayConfig {
    /// ring buffer 容量（帧）
    pub fn capacity_frames(&self) -> u64 {
        self.period_frames as u64 * self.buffer_periods as u64
    }

    /// 检查配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format.validate()?;
        if self.period_frames == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        let capacity = self.capacity_frames();
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.safety_offset_frames as u64 + self.period_frames as u64 > capacity {
            return Err(ConfigError::SafetyOffsetTooLarge {
                offset: self.safety_offset_frames,
                period: self.period_frames,
                capacity,
            });
        }
        Ok(())
    }

    /// 渲染端的附加延迟（毫秒）
    pub fn latency_ms(&self) -> f64 {
        self.format.frames_to_ns(self.safety_offset_frames as u64) as f64 / 1_000_000.0
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// 端口运行标志
///
/// `running` 由控制线程清除；`active` 在回调执行期间为 true。
/// 两者都用 SeqCst：要么回调看到 running == false，
/// 要么控制线程看到 active == true 并等待回调返回。
struct PortFlags {
    running: CachePadded<AtomicBool>,
    active: CachePadded<AtomicBool>,
}

impl PortFlags {
    fn new() -> Self {
        Self {
            running: CachePadded::new(AtomicBool::new(true)),
            active: CachePadded::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    fn enter(&self) -> Option<ActiveGuard<'_>> {
        self.active.store(true, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            Some(ActiveGuard(&self.active))
        } else {
            self.active.store(false, Ordering::Release);
            None
        }
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 清除 running 并等待正在执行的回调返回（控制线程调用）
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.active.load(Ordering::SeqCst) {
            backoff.snooze();
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 两个回调共享的状态
///
/// 完全基于原子操作，无锁设计
struct SharedState {
    ring: TimeRingBuffer,
    aligner: ClockAligner,
    safety_offset: SampleTime,
    input: PortFlags,
    output: PortFlags,
}

/// 采集端口（生产者）
///
/// 移交给采集回调所在的线程；`&mut self` 保证同一时刻只有一个生产者
pub struct InputPort {
    shared: Arc<SharedState>,
}

impl InputPort {
    /// 采集回调：每个设备周期调用一次
    ///
    /// 第一次调用记录输入流的首个采样时间，然后把数据写入 ring buffer。
    /// 会话停止后直接返回 0。参数非法时只计数，不会 panic。
    ///
    /// 返回写入的帧数。
    #[inline]
    pub fn on_input(
        &mut self,
        block: FrameBlock<'_>,
        frame_count: usize,
        sample_time: SampleTime,
    ) -> usize {
        let shared = &*self.shared;
        let Some(_guard) = shared.input.enter() else {
            return 0;
        };

        shared.aligner.observe_input_first_time(sample_time);
        shared.ring.store(block, frame_count, sample_time).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.shared.input.is_running()
    }
}

/// 渲染端口（消费者）
pub struct OutputPort {
    shared: Arc<SharedState>,
}

impl OutputPort {
    /// 渲染回调：每个设备周期调用一次
    ///
    /// 返回时 `out` 一定被完整填充（音频或静音）：
    /// - 时钟尚未对齐：静音，计入 unaligned
    /// - 对齐后：读取 `输出时间 + offset - safety_offset` 处的数据
    /// - 参数非法：尽量静音，计入 contract violation
    ///
    /// 返回来自真实数据的帧数。
    #[inline]
    pub fn on_output(
        &mut self,
        out: &mut FrameBlockMut<'_, '_>,
        frame_count: usize,
        sample_time: SampleTime,
    ) -> usize {
        let shared = &*self.shared;
        let Some(_guard) = shared.output.enter() else {
            out.fill_silence();
            return 0;
        };

        shared.aligner.observe_output_first_time(sample_time);

        let fetch_time = shared
            .aligner
            .aligned_fetch_time(sample_time)
            .and_then(|t| t.checked_sub(shared.safety_offset));
        let Some(fetch_time) = fetch_time else {
            out.fill_silence();
            shared.ring.stats().record_unaligned(frame_count as u64);
            return 0;
        };

        match shared.ring.fetch(out, frame_count, fetch_time) {
            Ok(served) => served,
            Err(_) => {
                out.fill_silence();
                0
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.output.is_running()
    }
}

/// 直通会话
///
/// 生命周期：
/// 1. `new()` 建立 ring buffer 和对齐器
/// 2. `input_port()` / `output_port()` 取出端口交给两个回调线程
/// 3. `stop_input()` → `stop_output()`（或 `shutdown()`）两阶段停止
///
/// 端口持有共享状态的 `Arc`，即使比会话活得更久也不会访问已释放的内存；
/// 停止后端口调用立即返回（输出端写静音）。
pub struct PlayThrough {
    config: RelayConfig,
    shared: Arc<SharedState>,
    input_taken: bool,
    output_taken: bool,
    state: SessionState,
}

impl PlayThrough {
    /// 建立会话
    pub fn new(config: RelayConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let ring =
            TimeRingBuffer::for_period(config.format, config.period_frames, config.buffer_periods)?;
        if config.lock_memory && !ring.lock_memory() {
            log::warn!("Continuing without locked ring buffer memory");
        }

        log::info!(
            "Relay session: {} | capacity {} frames ({:.1}ms) | period {} | safety offset {} frames ({:.1}ms)",
            config.format,
            ring.capacity(),
            config.format.frames_to_ns(ring.capacity() as u64) as f64 / 1_000_000.0,
            config.period_frames,
            config.safety_offset_frames,
            config.latency_ms()
        );

        let shared = Arc::new(SharedState {
            ring,
            aligner: ClockAligner::new(),
            safety_offset: config.safety_offset_frames as SampleTime,
            input: PortFlags::new(),
            output: PortFlags::new(),
        });

        Ok(Self {
            config,
            shared,
            input_taken: false,
            output_taken: false,
            state: SessionState::Running,
        })
    }

    /// 取出采集端口（只能取一次）
    pub fn input_port(&mut self) -> Result<InputPort, EngineError> {
        if self.input_taken {
            return Err(EngineError::InvalidState("input port already taken"));
        }
        self.input_taken = true;
        Ok(InputPort {
            shared: Arc::clone(&self.shared),
        })
    }

    /// 取出渲染端口（只能取一次）
    pub fn output_port(&mut self) -> Result<OutputPort, EngineError> {
        if self.output_taken {
            return Err(EngineError::InvalidState("output port already taken"));
        }
        self.output_taken = true;
        Ok(OutputPort {
            shared: Arc::clone(&self.shared),
        })
    }

    /// 第一阶段：停止生产者
    ///
    /// 返回时采集回调已经退出，之后的 `on_input` 调用不再写入
    pub fn stop_input(&mut self) -> Result<(), EngineError> {
        if self.state != SessionState::Running {
            return Err(EngineError::InvalidState("input already stopped"));
        }
        self.shared.input.stop();
        self.state = SessionState::InputStopped;
        log::info!("Input stopped");
        Ok(())
    }

    /// 第二阶段：停止消费者
    pub fn stop_output(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Running => {
                return Err(EngineError::InvalidState("stop the input before the output"))
            }
            SessionState::Stopped => {
                return Err(EngineError::InvalidState("output already stopped"))
            }
            SessionState::InputStopped => {}
        }
        self.shared.output.stop();
        self.state = SessionState::Stopped;
        log::info!("Output stopped");
        Ok(())
    }

    /// 按顺序停止两端并返回最终报告
    pub fn shutdown(mut self) -> StatsReport {
        self.stop_all();
        let report = self.report();
        log::info!(
            "Relay session closed: {} frames served, {} glitched cycles",
            report.frames_served,
            report.underrun_events
        );
        report
    }

    fn stop_all(&mut self) {
        if self.state == SessionState::Running {
            let _ = self.stop_input();
        }
        if self.state == SessionState::InputStopped {
            let _ = self.stop_output();
        }
    }

    /// 统计快照（非实时线程调用）
    pub fn report(&self) -> StatsReport {
        self.shared.ring.stats().report(self.shared.ring.capacity())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn align_state(&self) -> AlignState {
        self.shared.aligner.state()
    }

    /// 输入时间 - 输出时间（对齐后可用）
    pub fn offset(&self) -> Option<SampleTime> {
        self.shared.aligner.offset()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ring(&self) -> &TimeRingBuffer {
        &self.shared.ring
    }
}

impl Drop for PlayThrough {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FrameLayout, SampleFormat};
    use std::thread;

    fn mono_i16_config() -> RelayConfig {
        RelayConfig {
            format: StreamFormat::new(48000, 1, SampleFormat::I16),
            period_frames: 128,
            buffer_periods: 4,
            safety_offset_frames: 0,
            lock_memory: false,
        }
    }

    fn ramp(start: i16, frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| (start.wrapping_add(i as i16)).to_ne_bytes())
            .collect()
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.period_frames, 512);
        assert_eq!(config.capacity_frames(), 1536);
        assert_eq!(config.format.layout, FrameLayout::NonInterleaved);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_config_validate() {
        let mut config = mono_i16_config();
        config.period_frames = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPeriod));

        let mut config = mono_i16_config();
        config.buffer_periods = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));

        let mut config = mono_i16_config();
        config.safety_offset_frames = 400;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SafetyOffsetTooLarge { .. })
        ));

        assert!(matches!(
            PlayThrough::new(RelayConfig {
                format: StreamFormat::new(48000, 0, SampleFormat::F32),
                ..RelayConfig::default()
            }),
            Err(EngineError::Config(ConfigError::ZeroChannels))
        ));
    }

    #[test]
    fn test_ports_taken_once() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        assert!(session.input_port().is_ok());
        assert!(session.output_port().is_ok());
        assert!(matches!(
            session.input_port(),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            session.output_port(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_silence_before_alignment() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        let mut output = session.output_port().unwrap();

        let mut out = vec![0x55u8; 128 * 2];
        let served = output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 128, 50);
        assert_eq!(served, 0);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(session.align_state(), AlignState::OutputKnown);
        assert_eq!(session.report().unaligned_frames, 128);
    }

    /// 首个输入时间 1000，首个输出时间 50：输出时间 200 读取输入时间 1150
    #[test]
    fn test_aligned_relay() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        let data = ramp(0, 512);
        assert_eq!(input.on_input(FrameBlock::Interleaved(&data), 512, 1000), 512);

        let mut out = vec![0u8; 64 * 2];
        output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 64, 50);
        assert_eq!(session.offset(), Some(950));

        let served = output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 64, 200);
        assert_eq!(served, 64);
        assert_eq!(out, ramp(150, 64));
    }

    #[test]
    fn test_unrepresentable_offset_stays_silent() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        let mut out = vec![0x33u8; 64 * 2];
        output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 64, 1);
        input.on_input(FrameBlock::Interleaved(&ramp(0, 64)), 64, i64::MIN);

        let served = output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 64, 65);
        assert_eq!(served, 0);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(session.align_state(), AlignState::Overflowed);
        assert_eq!(session.offset(), None);
        assert_eq!(session.report().unaligned_frames, 128);
    }

    #[test]
    fn test_safety_offset_delays_output() {
        let mut config = mono_i16_config();
        config.safety_offset_frames = 128;
        let mut session = PlayThrough::new(config).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        let mut out = vec![0u8; 128 * 2];
        // 输出先启动：offset = 0 - 0
        output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 128, 0);
        input.on_input(FrameBlock::Interleaved(&ramp(0, 128)), 128, 0);
        input.on_input(FrameBlock::Interleaved(&ramp(128, 128)), 128, 128);

        let served = output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 128, 256);
        assert_eq!(served, 128);
        assert_eq!(out, ramp(128, 128));
    }

    #[test]
    fn test_contract_violation_becomes_silence() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        input.on_input(FrameBlock::Interleaved(&ramp(0, 128)), 128, 0);
        assert_eq!(input.on_input(FrameBlock::Interleaved(&[0u8; 4]), 128, 128), 0);

        let mut out = vec![0x77u8; 16];
        let served = output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 128, 0);
        assert_eq!(served, 0);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(session.report().contract_violations, 2);
    }

    #[test]
    fn test_two_phase_stop() {
        let mut session = PlayThrough::new(mono_i16_config()).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        assert!(matches!(
            session.stop_output(),
            Err(EngineError::InvalidState(_))
        ));

        session.stop_input().unwrap();
        assert_eq!(session.state(), SessionState::InputStopped);
        assert!(!input.is_running());
        assert!(output.is_running());
        assert_eq!(input.on_input(FrameBlock::Interleaved(&ramp(0, 128)), 128, 0), 0);
        assert_eq!(session.report().store_calls, 0);

        session.stop_output().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        let mut out = vec![0x11u8; 128 * 2];
        assert_eq!(
            output.on_output(&mut FrameBlockMut::Interleaved(&mut out), 128, 0),
            0
        );
        assert!(out.iter().all(|&b| b == 0));

        let report = session.shutdown();
        assert_eq!(report.fetch_calls, 0);
    }

    /// 生产者和消费者在各自线程上按周期推进，两者相差不超过容量
    #[test]
    fn test_threaded_relay() {
        use std::sync::atomic::AtomicI64;

        const PERIOD: usize = 128;
        const PERIODS: i64 = 400;

        let mut config = mono_i16_config();
        config.safety_offset_frames = PERIOD as u32;
        let mut session = PlayThrough::new(config).unwrap();
        let mut input = session.input_port().unwrap();
        let mut output = session.output_port().unwrap();

        // 生产者已完成的周期数 / 消费者已完成的周期数
        let produced = Arc::new(AtomicI64::new(0));
        let consumed = Arc::new(AtomicI64::new(0));

        let producer = {
            let produced = Arc::clone(&produced);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                for k in 0..PERIODS {
                    while consumed.load(Ordering::Acquire) < k - 1 {
                        std::hint::spin_loop();
                    }
                    let t = k * PERIOD as i64;
                    input.on_input(FrameBlock::Interleaved(&ramp(t as i16, PERIOD)), PERIOD, t);
                    produced.store(k + 1, Ordering::Release);
                }
            })
        };

        let consumer = thread::spawn(move || {
            let mut out = vec![0u8; PERIOD * 2];
            let mut mismatched = 0;
            // 输出时钟从 5000 开始，读取落后一个周期
            for k in 0..PERIODS - 2 {
                while produced.load(Ordering::Acquire) < k + 1 {
                    std::hint::spin_loop();
                }
                let t = 5000 + k * PERIOD as i64;
                output.on_output(&mut FrameBlockMut::Interleaved(&mut out), PERIOD, t);
                if k > 0 && out != ramp(((k - 1) * PERIOD as i64) as i16, PERIOD) {
                    mismatched += 1;
                }
                consumed.store(k + 1, Ordering::Release);
            }
            mismatched
        });

        producer.join().unwrap();
        let mismatched = consumer.join().unwrap();
        assert_eq!(mismatched, 0);
        assert_eq!(session.offset(), Some(-5000));

        let report = session.shutdown();
        assert_eq!(report.contract_violations, 0);
        assert_eq!(report.overwritten_frames, 0);
    }
}
