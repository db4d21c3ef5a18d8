//! 音频核心模块
//!
//! 包含：
//! - Format: 流格式、帧块视图和配置错误
//! - Ring Buffer: 按采样时间寻址的 lock-free 中继缓冲
//! - Clock: 采集 / 渲染时钟对齐
//! - Stats: 中继统计

pub mod clock;
pub mod format;
pub mod ring_buffer;
pub mod stats;

pub use clock::{AlignState, ClockAligner};
pub use format::{
    ConfigError, FrameBlock, FrameBlockMut, FrameLayout, SampleFormat, SampleTime, StreamFormat,
};
pub use ring_buffer::{RelayError, TimeRingBuffer, DEFAULT_BUFFER_PERIODS};
pub use stats::{RelayStats, SkewStats, StatsReport};
