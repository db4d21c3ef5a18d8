//! 流格式与帧块视图
//!
//! 采集端与渲染端在会话建立时约定同一种格式，之后不再协商：
//! - 采样格式：i16 / i32 / f32，均为本机字节序
//! - 布局：交织（所有声道在一个 buffer）或非交织（每声道一个 buffer）
//!
//! 所有支持的采样格式中，全零字节都表示静音，
//! 因此 underrun 时直接写零即可，不需要格式转换。

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// 绝对采样时间（帧计数）
///
/// 每条流各自单调递增，两条流之间没有固定关系
pub type SampleTime = i64;

/// 配置错误
///
/// 只在会话建立阶段出现，出现即说明会话不能启动
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("safety offset of {offset} frames leaves no room for a {period}-frame period in a {capacity}-frame ring")]
    SafetyOffsetTooLarge {
        offset: u32,
        period: u32,
        capacity: u64,
    },
    #[error("period of {period} frames does not fit a {capacity}-frame ring")]
    PeriodExceedsCapacity { period: u32, capacity: u64 },
    #[error("{channels} channels requested, at most {max} supported")]
    TooManyChannels { channels: u16, max: usize },
    #[error("channel count must be at least 1")]
    ZeroChannels,
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,
    #[error("ring buffer capacity must be at least 1 frame")]
    ZeroCapacity,
    #[error("device period must be at least 1 frame")]
    ZeroPeriod,
    #[error("ring buffer capacity of {0} frames is too large")]
    CapacityTooLarge(u64),
    #[error("unknown sample format '{0}' (expected i16, i32 or f32)")]
    UnknownSampleFormat(String),
    #[error("unknown layout '{0}' (expected interleaved or non-interleaved)")]
    UnknownLayout(String),
}

/// 采样格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    I32,
    F32,
}

impl SampleFormat {
    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::F32 => "f32",
        };
        f.write_str(name)
    }
}

impl FromStr for SampleFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "i16" | "s16" | "16" => Ok(Self::I16),
            "i32" | "s32" | "32" => Ok(Self::I32),
            "f32" | "float" => Ok(Self::F32),
            _ => Err(ConfigError::UnknownSampleFormat(s.to_string())),
        }
    }
}

/// 帧布局
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameLayout {
    /// 交织：LRLRLR...，所有样本在一个 buffer
    #[default]
    Interleaved,
    /// 非交织：每声道独立 buffer，buffers[0]=L, buffers[1]=R
    NonInterleaved,
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interleaved => f.write_str("interleaved"),
            Self::NonInterleaved => f.write_str("non-interleaved"),
        }
    }
}

impl FromStr for FrameLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interleaved" | "i" => Ok(Self::Interleaved),
            "non-interleaved" | "noninterleaved" | "planar" | "n" => Ok(Self::NonInterleaved),
            _ => Err(ConfigError::UnknownLayout(s.to_string())),
        }
    }
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub layout: FrameLayout,
}

impl StreamFormat {
    /// 创建交织布局的格式
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
            layout: FrameLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: FrameLayout) -> Self {
        self.layout = layout;
        self
    }

    /// 检查格式参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        Ok(())
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes_per_sample()
    }

    /// 每帧的字节数（所有声道）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// buffer 个数：交织为 1，非交织为声道数
    #[inline]
    pub fn buffer_count(&self) -> usize {
        match self.layout {
            FrameLayout::Interleaved => 1,
            FrameLayout::NonInterleaved => self.channels as usize,
        }
    }

    /// 一帧在单个 buffer 中占用的字节数
    #[inline]
    pub fn bytes_per_slot(&self) -> usize {
        match self.layout {
            FrameLayout::Interleaved => self.bytes_per_frame(),
            FrameLayout::NonInterleaved => self.bytes_per_sample(),
        }
    }

    /// 帧数对应的时长（纳秒）
    #[inline]
    pub fn frames_to_ns(&self, frames: u64) -> u64 {
        frames * 1_000_000_000 / self.sample_rate.max(1) as u64
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(48000, 2, SampleFormat::F32).with_layout(FrameLayout::NonInterleaved)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {} {}",
            self.sample_rate, self.channels, self.sample_format, self.layout
        )
    }
}

/// 只读帧块（采集端提供）
///
/// 调用方拥有内存，ring buffer 只在调用期间读取
#[derive(Clone, Copy, Debug)]
pub enum FrameBlock<'a> {
    Interleaved(&'a [u8]),
    NonInterleaved(&'a [&'a [u8]]),
}

impl<'a> FrameBlock<'a> {
    #[inline]
    pub fn layout(&self) -> FrameLayout {
        match self {
            Self::Interleaved(_) => FrameLayout::Interleaved,
            Self::NonInterleaved(_) => FrameLayout::NonInterleaved,
        }
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        match self {
            Self::Interleaved(_) => 1,
            Self::NonInterleaved(buffers) => buffers.len(),
        }
    }

    /// 第 `index` 个 buffer
    #[inline]
    pub fn buffer(&self, index: usize) -> &'a [u8] {
        match *self {
            Self::Interleaved(data) => data,
            Self::NonInterleaved(buffers) => buffers[index],
        }
    }
}

/// 可写帧块（渲染端提供）
#[derive(Debug)]
pub enum FrameBlockMut<'a, 'b> {
    Interleaved(&'a mut [u8]),
    NonInterleaved(&'a mut [&'b mut [u8]]),
}

impl FrameBlockMut<'_, '_> {
    #[inline]
    pub fn layout(&self) -> FrameLayout {
        match self {
            Self::Interleaved(_) => FrameLayout::Interleaved,
            Self::NonInterleaved(_) => FrameLayout::NonInterleaved,
        }
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        match self {
            Self::Interleaved(_) => 1,
            Self::NonInterleaved(buffers) => buffers.len(),
        }
    }

    #[inline]
    pub fn buffer_len(&self, index: usize) -> usize {
        match self {
            Self::Interleaved(data) => data.len(),
            Self::NonInterleaved(buffers) => buffers[index].len(),
        }
    }

    #[inline]
    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        match self {
            Self::Interleaved(data) => &mut data[..],
            Self::NonInterleaved(buffers) => &mut buffers[index][..],
        }
    }

    /// 所有 buffer 写零（静音）
    pub fn fill_silence(&mut self) {
        match self {
            Self::Interleaved(data) => data.fill(0),
            Self::NonInterleaved(buffers) => {
                for buffer in buffers.iter_mut() {
                    buffer.fill(0);
                }
            }
        }
    }
}
