//! 中继统计模块
//!
//! 实时回调只做 Relaxed 原子累加，不记录日志；
//! 非实时线程通过 `report()` 读取快照。
//! 读写时间差（skew）采用降频采样策略减少开销。

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// skew 采样间隔：每 N 次 fetch 才采样一次
const SKEW_SAMPLE_INTERVAL: u64 = 16;

/// skew 采样缓冲区大小
const SKEW_BUFFER_SIZE: usize = 256;

/// 中继统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct RelayStats {
    store_calls: AtomicU64,
    frames_stored: AtomicU64,
    late_stores: AtomicU64,

    fetch_calls: AtomicU64,
    frames_served: AtomicU64,
    // 含有静音帧的 fetch 次数
    underrun_events: AtomicU64,
    // 尚未写入而补零的帧
    underrun_frames: AtomicU64,
    // 已被覆盖而补零的帧
    overrun_frames: AtomicU64,
    // 复制过程中被生产者覆盖的帧
    overwritten_frames: AtomicU64,

    // 时钟对齐前渲染端输出的静音帧
    unaligned_frames: AtomicU64,
    contract_violations: AtomicU64,

    // skew = 生产者 end - 消费者请求的 end
    skew_buffer: Box<[AtomicI64; SKEW_BUFFER_SIZE]>,
    skew_write_idx: AtomicUsize,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            store_calls: AtomicU64::new(0),
            frames_stored: AtomicU64::new(0),
            late_stores: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
            frames_served: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            overrun_frames: AtomicU64::new(0),
            overwritten_frames: AtomicU64::new(0),
            unaligned_frames: AtomicU64::new(0),
            contract_violations: AtomicU64::new(0),
            skew_buffer: Box::new(std::array::from_fn(|_| AtomicI64::new(0))),
            skew_write_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn record_store(&self, frames: u64) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.frames_stored.fetch_add(frames, Ordering::Relaxed);
    }

    /// 整块早于有效窗口、被丢弃的 store
    #[inline]
    pub fn record_late_store(&self) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        self.late_stores.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch(&self, served: u64, underrun: u64, overrun: u64, overwritten: u64) {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.frames_served.fetch_add(served, Ordering::Relaxed);

        let missing = underrun + overrun + overwritten;
        if missing > 0 {
            self.underrun_events.fetch_add(1, Ordering::Relaxed);
            self.underrun_frames.fetch_add(underrun, Ordering::Relaxed);
            self.overrun_frames.fetch_add(overrun, Ordering::Relaxed);
            self.overwritten_frames
                .fetch_add(overwritten, Ordering::Relaxed);
        }
    }

    /// 在 fetch 内调用，只在采样点写入
    #[inline]
    pub fn sample_skew(&self, skew: i64) {
        let count = self.fetch_calls.load(Ordering::Relaxed);
        if count % SKEW_SAMPLE_INTERVAL == 0 {
            let idx = self.skew_write_idx.fetch_add(1, Ordering::Relaxed) % SKEW_BUFFER_SIZE;
            self.skew_buffer[idx].store(skew, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_unaligned(&self, frames: u64) {
        self.unaligned_frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_contract_violation(&self) {
        self.contract_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::Relaxed)
    }

    pub fn frames_stored(&self) -> u64 {
        self.frames_stored.load(Ordering::Relaxed)
    }

    pub fn late_stores(&self) -> u64 {
        self.late_stores.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn frames_served(&self) -> u64 {
        self.frames_served.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    pub fn overrun_frames(&self) -> u64 {
        self.overrun_frames.load(Ordering::Relaxed)
    }

    pub fn overwritten_frames(&self) -> u64 {
        self.overwritten_frames.load(Ordering::Relaxed)
    }

    pub fn unaligned_frames(&self) -> u64 {
        self.unaligned_frames.load(Ordering::Relaxed)
    }

    pub fn contract_violations(&self) -> u64 {
        self.contract_violations.load(Ordering::Relaxed)
    }

    /// 按时间顺序取出 skew 采样（最旧的在前）
    fn skew_samples(&self) -> Vec<i64> {
        let written = self.skew_write_idx.load(Ordering::Relaxed);
        let len = written.min(SKEW_BUFFER_SIZE);
        let oldest = if written > SKEW_BUFFER_SIZE {
            written % SKEW_BUFFER_SIZE
        } else {
            0
        };

        (0..len)
            .map(|i| self.skew_buffer[(oldest + i) % SKEW_BUFFER_SIZE].load(Ordering::Relaxed))
            .collect()
    }

    /// 生成报告
    pub fn report(&self, capacity: usize) -> StatsReport {
        let samples = self.skew_samples();
        let skew_stats = match (samples.first(), samples.last()) {
            (Some(&first), Some(&latest)) => Some(SkewStats {
                min: samples.iter().copied().fold(i64::MAX, i64::min),
                max: samples.iter().copied().fold(i64::MIN, i64::max),
                latest,
                drift: latest.saturating_sub(first),
                sample_count: samples.len(),
            }),
            _ => None,
        };

        StatsReport {
            capacity,
            skew_sample_interval: SKEW_SAMPLE_INTERVAL,
            store_calls: self.store_calls(),
            frames_stored: self.frames_stored(),
            late_stores: self.late_stores(),
            fetch_calls: self.fetch_calls(),
            frames_served: self.frames_served(),
            underrun_events: self.underrun_events(),
            underrun_frames: self.underrun_frames(),
            overrun_frames: self.overrun_frames(),
            overwritten_frames: self.overwritten_frames(),
            unaligned_frames: self.unaligned_frames(),
            contract_violations: self.contract_violations(),
            skew_stats,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub capacity: usize,
    pub skew_sample_interval: u64,
    pub store_calls: u64,
    pub frames_stored: u64,
    pub late_stores: u64,
    pub fetch_calls: u64,
    pub frames_served: u64,
    pub underrun_events: u64,
    pub underrun_frames: u64,
    pub overrun_frames: u64,
    pub overwritten_frames: u64,
    pub unaligned_frames: u64,
    pub contract_violations: u64,
    pub skew_stats: Option<SkewStats>,
}

/// 生产者领先消费者的帧数（降频采样）
#[derive(Debug, Clone)]
pub struct SkewStats {
    pub min: i64,
    pub max: i64,
    pub latest: i64,
    /// 最新采样 - 最旧采样；持续非零说明两个时钟速率不一致
    pub drift: i64,
    pub sample_count: usize,
}

impl StatsReport {
    /// 是否观察到任何静音补偿
    pub fn has_glitches(&self) -> bool {
        self.underrun_frames + self.overrun_frames + self.overwritten_frames > 0
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relay Statistics")?;
        writeln!(f, "================")?;
        writeln!(f, "Ring capacity: {} frames", self.capacity)?;
        writeln!(f)?;

        writeln!(f, "Input (store):")?;
        writeln!(f, "  Calls: {}", self.store_calls)?;
        writeln!(f, "  Frames stored: {}", self.frames_stored)?;
        writeln!(f, "  Late stores dropped: {}", self.late_stores)?;
        writeln!(f)?;

        writeln!(f, "Output (fetch):")?;
        writeln!(f, "  Calls: {}", self.fetch_calls)?;
        writeln!(f, "  Frames served: {}", self.frames_served)?;
        writeln!(f, "  Silent before alignment: {} frames", self.unaligned_frames)?;
        writeln!(f, "  Glitched cycles: {}", self.underrun_events)?;
        writeln!(f, "    Underrun (not yet stored): {} frames", self.underrun_frames)?;
        writeln!(f, "    Overrun (already evicted): {} frames", self.overrun_frames)?;
        writeln!(f, "    Overwritten during copy: {} frames", self.overwritten_frames)?;
        writeln!(f)?;

        match &self.skew_stats {
            Some(skew) => {
                writeln!(
                    f,
                    "Producer Lead (per {} fetches, {} samples):",
                    self.skew_sample_interval, skew.sample_count
                )?;
                writeln!(f, "  Min: {} frames", skew.min)?;
                writeln!(f, "  Max: {} frames", skew.max)?;
                writeln!(f, "  Latest: {} frames", skew.latest)?;
                writeln!(f, "  Drift: {:+} frames", skew.drift)?;
            }
            None => writeln!(f, "Producer Lead: no samples")?,
        }
        writeln!(f)?;

        writeln!(f, "Contract violations: {}", self.contract_violations)?;

        Ok(())
    }
}
