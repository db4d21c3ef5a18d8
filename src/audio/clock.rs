//! 采集 / 渲染时钟对齐
//!
//! 两个回调各自报告第一次回调的采样时间，
//! 双方都到齐后计算一次 `offset = 首个输入时间 - 首个输出时间`，
//! 之后渲染端用 `输出时间 + offset` 去 ring buffer 取数据。
//!
//! 假设两条流采样率相同，只有相位（起始时间）不同，
//! 所以 offset 在整个会话期间固定，不会重新计算。
//!
//! 状态机：
//! ```text
//! Unset ──输入先到──▶ InputKnown  ──输出到达──▶ Aligned
//!   └───输出先到──▶ OutputKnown ──输入到达──▶ Aligned
//! ```
//! Aligned 是终态；新会话需要新建对齐器。
//! 两个首次时间之差超出 i64 时进入 Overflowed，同样是终态，不提供 offset。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use super::format::SampleTime;

const INPUT_OBSERVED: u8 = 0b01;
const OUTPUT_OBSERVED: u8 = 0b10;

/// 对齐状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignState {
    Unset,
    InputKnown,
    OutputKnown,
    Aligned,
    /// 两个首次时间之差无法表示
    Overflowed,
}

impl fmt::Display for AlignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unset => "unset",
            Self::InputKnown => "input known",
            Self::OutputKnown => "output known",
            Self::Aligned => "aligned",
            Self::Overflowed => "overflowed",
        };
        f.write_str(s)
    }
}

/// 时钟对齐器
///
/// 所有方法都是 lock-free 的，可以在两个实时回调中并发调用。
/// 两侧首次观察同时发生时，后完成发布的一侧负责计算 offset，
/// 保证 offset 只计算一次。
pub struct ClockAligner {
    // 每侧只有第一次调用能认领
    input_claimed: AtomicBool,
    output_claimed: AtomicBool,

    first_input: AtomicI64,
    first_output: AtomicI64,
    // 已发布的首次时间（INPUT_OBSERVED | OUTPUT_OBSERVED）
    observed: AtomicU8,

    offset: AtomicI64,
    aligned: AtomicBool,
    failed: AtomicBool,
}

impl ClockAligner {
    pub fn new() -> Self {
        Self {
            input_claimed: AtomicBool::new(false),
            output_claimed: AtomicBool::new(false),
            first_input: AtomicI64::new(0),
            first_output: AtomicI64::new(0),
            observed: AtomicU8::new(0),
            offset: AtomicI64::new(0),
            aligned: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// 记录输入流的首个采样时间（采集回调内调用）
    ///
    /// 只有第一次调用生效，之后的调用直接返回
    #[inline]
    pub fn observe_input_first_time(&self, sample_time: SampleTime) {
        if !Self::claim(&self.input_claimed) {
            return;
        }
        self.first_input.store(sample_time, Ordering::Relaxed);

        let prev = self.observed.fetch_or(INPUT_OBSERVED, Ordering::AcqRel);
        if prev & OUTPUT_OBSERVED != 0 {
            let first_output = self.first_output.load(Ordering::Relaxed);
            self.publish_offset(sample_time.checked_sub(first_output));
        }
    }

    /// 记录输出流的首个采样时间（渲染回调内调用）
    #[inline]
    pub fn observe_output_first_time(&self, sample_time: SampleTime) {
        if !Self::claim(&self.output_claimed) {
            return;
        }
        self.first_output.store(sample_time, Ordering::Relaxed);

        let prev = self.observed.fetch_or(OUTPUT_OBSERVED, Ordering::AcqRel);
        if prev & INPUT_OBSERVED != 0 {
            let first_input = self.first_input.load(Ordering::Relaxed);
            self.publish_offset(first_input.checked_sub(sample_time));
        }
    }

    /// 把输出时间映射到输入时间轴
    ///
    /// 对齐前返回 None：本周期应输出静音
    #[inline]
    pub fn aligned_fetch_time(&self, output_time: SampleTime) -> Option<SampleTime> {
        self.offset()
            .and_then(|offset| output_time.checked_add(offset))
    }

    /// 已计算的 offset
    #[inline]
    pub fn offset(&self) -> Option<SampleTime> {
        if self.aligned.load(Ordering::Acquire) {
            Some(self.offset.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn first_input_time(&self) -> Option<SampleTime> {
        if self.observed.load(Ordering::Acquire) & INPUT_OBSERVED != 0 {
            Some(self.first_input.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn first_output_time(&self) -> Option<SampleTime> {
        if self.observed.load(Ordering::Acquire) & OUTPUT_OBSERVED != 0 {
            Some(self.first_output.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn state(&self) -> AlignState {
        if self.aligned.load(Ordering::Acquire) {
            return AlignState::Aligned;
        }
        if self.failed.load(Ordering::Acquire) {
            return AlignState::Overflowed;
        }
        let observed = self.observed.load(Ordering::Acquire);
        if observed & INPUT_OBSERVED != 0 {
            AlignState::InputKnown
        } else if observed & OUTPUT_OBSERVED != 0 {
            AlignState::OutputKnown
        } else {
            AlignState::Unset
        }
    }

    /// 快速路径只做一次 Relaxed 读取，避免每个周期都执行 RMW
    #[inline]
    fn claim(flag: &AtomicBool) -> bool {
        !flag.load(Ordering::Relaxed)
            && flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    fn publish_offset(&self, offset: Option<SampleTime>) {
        match offset {
            Some(offset) => {
                self.offset.store(offset, Ordering::Relaxed);
                self.aligned.store(true, Ordering::Release);
            }
            None => self.failed.store(true, Ordering::Release),
        }
    }
}

impl Default for ClockAligner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_offset_input_first() {
        let aligner = ClockAligner::new();
        assert_eq!(aligner.state(), AlignState::Unset);
        assert_eq!(aligner.aligned_fetch_time(200), None);

        aligner.observe_input_first_time(1000);
        assert_eq!(aligner.state(), AlignState::InputKnown);
        assert_eq!(aligner.aligned_fetch_time(200), None);

        aligner.observe_output_first_time(50);
        assert_eq!(aligner.state(), AlignState::Aligned);
        assert_eq!(aligner.offset(), Some(950));
        assert_eq!(aligner.aligned_fetch_time(200), Some(1150));
    }

    #[test]
    fn test_offset_output_first() {
        let aligner = ClockAligner::new();
        aligner.observe_output_first_time(50);
        assert_eq!(aligner.state(), AlignState::OutputKnown);
        assert_eq!(aligner.first_output_time(), Some(50));
        assert_eq!(aligner.first_input_time(), None);

        aligner.observe_input_first_time(1000);
        assert_eq!(aligner.offset(), Some(950));
        assert_eq!(aligner.aligned_fetch_time(200), Some(1150));
    }

    #[test]
    fn test_repeated_observations_ignored() {
        let aligner = ClockAligner::new();
        aligner.observe_input_first_time(1000);
        aligner.observe_input_first_time(5);
        aligner.observe_output_first_time(50);
        assert_eq!(aligner.offset(), Some(950));

        aligner.observe_input_first_time(-7000);
        aligner.observe_output_first_time(123_456);
        assert_eq!(aligner.offset(), Some(950));
        assert_eq!(aligner.first_input_time(), Some(1000));
        assert_eq!(aligner.first_output_time(), Some(50));
    }

    #[test]
    fn test_negative_offset() {
        let aligner = ClockAligner::new();
        aligner.observe_input_first_time(0);
        aligner.observe_output_first_time(4096);
        assert_eq!(aligner.offset(), Some(-4096));
        assert_eq!(aligner.aligned_fetch_time(5000), Some(904));
    }

    #[test]
    fn test_overflow_is_unavailable() {
        let aligner = ClockAligner::new();
        aligner.observe_input_first_time(1000);
        aligner.observe_output_first_time(0);
        assert_eq!(aligner.aligned_fetch_time(i64::MAX), None);
    }

    #[test]
    fn test_offset_overflow_leaves_unaligned() {
        let aligner = ClockAligner::new();
        aligner.observe_input_first_time(i64::MAX);
        aligner.observe_output_first_time(-1);
        assert_eq!(aligner.state(), AlignState::Overflowed);
        assert_eq!(aligner.offset(), None);
        assert_eq!(aligner.aligned_fetch_time(0), None);

        let aligner = ClockAligner::new();
        aligner.observe_output_first_time(1);
        aligner.observe_input_first_time(i64::MIN);
        assert_eq!(aligner.state(), AlignState::Overflowed);
        assert_eq!(aligner.aligned_fetch_time(1), None);
    }

    #[test]
    fn test_concurrent_first_observation() {
        for round in 0..200i64 {
            let aligner = ClockAligner::new();
            let barrier = Barrier::new(2);

            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    aligner.observe_input_first_time(10_000 + round);
                });
                s.spawn(|| {
                    barrier.wait();
                    aligner.observe_output_first_time(round);
                });
            });

            assert_eq!(aligner.state(), AlignState::Aligned);
            assert_eq!(aligner.offset(), Some(10_000));
        }
    }
}
