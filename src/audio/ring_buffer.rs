//! 按采样时间寻址的环形缓冲区
//!
//! 设计目标：
//! - 零锁：store / fetch 只使用原子操作，不阻塞任何实时线程
//! - 零分配：存储在创建时一次性分配并清零
//! - 时间寻址：帧的位置由绝对采样时间 `t mod capacity` 决定，而不是读写游标
//! - 缓存友好：有效区间边界使用 `CachePadded` 独占 cache line
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 用于采集回调（生产者）和渲染回调（消费者）之间的数据传递，
//! 两个回调由各自的硬件时钟驱动。
//!
//! # 一致性模型
//!
//! store 和 fetch 之间没有互斥。容量必须大于读写两端的最大时间差
//! （通常为设备周期的 2~3 倍），这样消费者读取时间 T 时，
//! 生产者还远没有写到 T + capacity。
//!
//! 有效区间 `[start, end)` 的发布顺序（seqlock 风格）：
//! 1. 生产者先推进 `start`（声明即将覆盖的旧帧失效），然后 release fence
//! 2. 写入样本
//! 3. release 存储新的 `end`
//!
//! 写入早于 `start` 的帧时顺序相反：先写样本，再 release 存储更小的 `start`。
//!
//! 消费者 acquire 读取 `end` 和 `start`，复制样本，acquire fence 后重读 `start`。
//! 复制期间被覆盖的帧会被检测到并补零，所以极端抖动只会产生静音，不会产生错位数据。
//! 样本按字节原子存储，不存在字节内撕裂。

use std::ops::Range;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use super::format::{ConfigError, FrameBlock, FrameBlockMut, FrameLayout, SampleTime, StreamFormat};
use super::stats::RelayStats;

/// 默认容量：设备周期的倍数
pub const DEFAULT_BUFFER_PERIODS: u32 = 3;

/// 调用约定错误
///
/// 只在参数非法时返回；underrun / overrun 不是错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("frame count must be non-zero")]
    ZeroFrames,
    #[error("frame block is {actual} but the ring stores {expected} frames")]
    LayoutMismatch {
        expected: FrameLayout,
        actual: FrameLayout,
    },
    #[error("frame block has {actual} buffers, expected {expected}")]
    BufferCountMismatch { expected: usize, actual: usize },
    #[error("buffer {index} holds {actual} bytes, {required} required")]
    BufferTooSmall {
        index: usize,
        required: usize,
        actual: usize,
    },
}

/// 按采样时间寻址的无锁环形缓冲区
///
/// 内存布局：
/// - 每个 buffer（交织为 1 个，非交织为每声道 1 个）占用一段
///   `capacity * bytes_per_slot` 字节的连续存储
/// - `start` 和 `end` 各自独占一个 cache line
pub struct TimeRingBuffer {
    format: StreamFormat,
    capacity: usize,
    bytes_per_slot: usize,
    buffer_bytes: usize,
    storage: Box<[AtomicU8]>,

    // 有效区间 [start, end)，只由生产者写入
    start: CachePadded<AtomicI64>,
    end: CachePadded<AtomicI64>,
    // 第一次 store 完成前没有有效区间
    primed: AtomicBool,

    // 诊断用：消费者请求过的最大时间
    last_fetched: CachePadded<AtomicI64>,
    fetched: AtomicBool,

    stats: RelayStats,
    memory_locked: AtomicBool,
}

impl TimeRingBuffer {
    /// 创建指定容量（帧）的 ring buffer
    pub fn new(format: StreamFormat, capacity: usize) -> Result<Self, ConfigError> {
        format.validate()?;
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        let bytes_per_slot = format.bytes_per_slot();
        let too_large = || ConfigError::CapacityTooLarge(capacity as u64);
        if i64::try_from(capacity).is_err() {
            return Err(too_large());
        }
        let buffer_bytes = capacity.checked_mul(bytes_per_slot).ok_or_else(too_large)?;
        let total_bytes = buffer_bytes
            .checked_mul(format.buffer_count())
            .ok_or_else(too_large)?;

        let storage: Vec<AtomicU8> = (0..total_bytes).map(|_| AtomicU8::new(0)).collect();

        log::debug!(
            "Time ring buffer: {} frames, {} ({} bytes)",
            capacity,
            format,
            total_bytes
        );

        Ok(Self {
            format,
            capacity,
            bytes_per_slot,
            buffer_bytes,
            storage: storage.into_boxed_slice(),
            start: CachePadded::new(AtomicI64::new(0)),
            end: CachePadded::new(AtomicI64::new(0)),
            primed: AtomicBool::new(false),
            last_fetched: CachePadded::new(AtomicI64::new(0)),
            fetched: AtomicBool::new(false),
            stats: RelayStats::new(),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 按设备周期创建：容量 = period_frames * periods
    pub fn for_period(
        format: StreamFormat,
        period_frames: u32,
        periods: u32,
    ) -> Result<Self, ConfigError> {
        if period_frames == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        let capacity = period_frames as u64 * periods as u64;
        let capacity =
            usize::try_from(capacity).map_err(|_| ConfigError::CapacityTooLarge(capacity))?;
        Self::new(format, capacity)
    }

    /// 锁定存储内存，防止被换页
    ///
    /// 实时回调中的 page fault 会直接造成 dropout。
    /// 只应在会话建立阶段（非实时线程）调用。
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let len = self.storage.len();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁存储内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let len = self.storage.len();

        unsafe {
            libc::munlock(ptr, len);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    /// 写入帧（生产者 / 采集回调调用）
    ///
    /// 把 `frame_count` 帧写到时间 `start_time .. start_time + frame_count` 对应的槽位。
    /// - 超过容量时只保留最近的 `capacity` 帧
    /// - 与上次写入之间有空洞时，空洞补零
    /// - 早于 start 但仍在 `end - capacity` 之后的帧照常写入，并放宽 start
    /// - 早于 `end - capacity` 的帧被丢弃（不会覆盖更新的数据）
    ///
    /// 返回实际写入的帧数。
    /// 此函数是 wait-free 的：无锁、无分配、无系统调用。
    pub fn store(
        &self,
        frames: FrameBlock<'_>,
        frame_count: usize,
        start_time: SampleTime,
    ) -> Result<usize, RelayError> {
        if let Err(e) = self.check_block(
            frames.layout(),
            frames.buffer_count(),
            |i| frames.buffer(i).len(),
            frame_count,
        ) {
            self.stats.record_contract_violation();
            return Err(e);
        }

        let capacity = self.capacity as i64;
        let count = i64::try_from(frame_count).unwrap_or(i64::MAX);
        let block_end = start_time.saturating_add(count);
        // 只保留最近的 capacity 帧
        let mut write_start = start_time.max(block_end.saturating_sub(capacity));
        let write_end = block_end;

        if !self.primed.load(Ordering::Relaxed) {
            self.copy_in(&frames, start_time, write_start, write_end);
            self.start.store(write_start, Ordering::Relaxed);
            self.end.store(write_end, Ordering::Relaxed);
            self.primed.store(true, Ordering::Release);
            self.stats.record_store((write_end - write_start) as u64);
            return Ok((write_end - write_start) as usize);
        }

        // 只有生产者写 start / end，Relaxed 读取自己的值即可
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);

        // 窗口能容纳的最早时间：更早的帧已无槽位
        write_start = write_start.max(end.saturating_sub(capacity));
        if write_end <= write_start {
            self.stats.record_late_store();
            return Ok(0);
        }

        let new_end = end.max(write_end);
        let new_start = start.max(new_end.saturating_sub(capacity));

        if new_start > start {
            // 先声明失效，再覆盖
            self.start.store(new_start, Ordering::Relaxed);
            fence(Ordering::Release);
        }

        // 旧 end 与本次写入起点之间的空洞补零
        let gap_start = end.max(new_start);
        if write_start > gap_start {
            for buffer in 0..self.format.buffer_count() {
                self.zero_slots(buffer, gap_start, (write_start - gap_start) as usize);
            }
        }

        // 早于 start 的写入：本次写入终点与旧 start 之间的空洞补零
        // 这些槽位不在有效区间内，消费者不会读取
        if write_end < new_start {
            for buffer in 0..self.format.buffer_count() {
                self.zero_slots(buffer, write_end, (new_start - write_end) as usize);
            }
        }

        self.copy_in(&frames, start_time, write_start, write_end);
        if write_start < new_start {
            // 数据写完后再放宽下界
            self.start.store(write_start, Ordering::Release);
        }
        self.end.store(new_end, Ordering::Release);

        let written = (write_end - write_start) as u64;
        self.stats.record_store(written);
        Ok(written as usize)
    }

    /// 读取帧（消费者 / 渲染回调调用）
    ///
    /// 从 `start_time` 开始读取 `frame_count` 帧到 `out`。
    /// 不在有效区间内的帧（尚未写入或已被覆盖）一律写零，调用仍然成功。
    ///
    /// 返回来自真实数据的帧数（其余为静音）。
    /// 此函数是 wait-free 的：无锁、无分配、无系统调用。
    pub fn fetch(
        &self,
        out: &mut FrameBlockMut<'_, '_>,
        frame_count: usize,
        start_time: SampleTime,
    ) -> Result<usize, RelayError> {
        if let Err(e) = self.check_block(
            out.layout(),
            out.buffer_count(),
            |i| out.buffer_len(i),
            frame_count,
        ) {
            self.stats.record_contract_violation();
            return Err(e);
        }

        let count = i64::try_from(frame_count).unwrap_or(i64::MAX);
        let req_start = start_time;
        let req_end = start_time.saturating_add(count);
        self.mark_fetched(req_end - 1);

        if !self.primed.load(Ordering::Acquire) {
            self.zero_out(out, 0, frame_count);
            self.stats.record_fetch(0, frame_count as u64, 0, 0);
            return Ok(0);
        }

        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        self.stats.sample_skew(end.saturating_sub(req_end));

        let copy_start = req_start.max(start).min(req_end);
        let copy_end = req_end.min(end).max(copy_start);

        // 太旧（已被覆盖）的部分算 overrun，太新（尚未写入）的部分算 underrun
        let evicted = (copy_start - req_start) as usize;
        let len = (copy_end - copy_start) as usize;
        let pending = frame_count - evicted - len;
        self.zero_out(out, 0, evicted);
        self.zero_out(out, frame_count - pending, pending);

        if len == 0 {
            self.stats.record_fetch(0, pending as u64, evicted as u64, 0);
            return Ok(0);
        }

        let bps = self.bytes_per_slot;
        let offset = evicted;
        for buffer in 0..self.format.buffer_count() {
            let dst = &mut out.buffer_mut(buffer)[offset * bps..(offset + len) * bps];
            self.copy_out(buffer, copy_start, dst);
        }

        // 复制期间生产者可能推进了 start，被覆盖的帧补零
        fence(Ordering::Acquire);
        let start_after = self.start.load(Ordering::Relaxed);
        let mut overwritten = 0;
        if start_after > copy_start {
            overwritten = (start_after.min(copy_end) - copy_start) as usize;
            self.zero_out(out, offset, overwritten);
        }

        let served = len - overwritten;
        self.stats.record_fetch(
            served as u64,
            pending as u64,
            evicted as u64,
            overwritten as u64,
        );
        Ok(served)
    }

    /// 获取容量（帧）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// 当前可读取的时间区间
    pub fn valid_range(&self) -> Option<Range<SampleTime>> {
        if !self.primed.load(Ordering::Acquire) {
            return None;
        }
        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        Some(start.min(end)..end)
    }

    /// 已写入的最大帧时间
    pub fn last_stored_time(&self) -> Option<SampleTime> {
        if !self.primed.load(Ordering::Acquire) {
            return None;
        }
        Some(self.end.load(Ordering::Acquire) - 1)
    }

    /// 已请求过的最大帧时间
    pub fn last_fetched_time(&self) -> Option<SampleTime> {
        if !self.fetched.load(Ordering::Acquire) {
            return None;
        }
        Some(self.last_fetched.load(Ordering::Relaxed))
    }

    /// 生产者领先消费者的帧数
    ///
    /// 持续增长说明生产者跑得比消费者快（overrun 趋势），
    /// 持续下降到负数说明消费者追上了生产者（underrun 趋势）
    pub fn skew(&self) -> Option<i64> {
        self.last_stored_time()?
            .checked_sub(self.last_fetched_time()?)
    }

    /// 诊断计数器（供非实时线程读取）
    #[inline]
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    fn mark_fetched(&self, time: SampleTime) {
        if self.fetched.load(Ordering::Relaxed) {
            self.last_fetched.fetch_max(time, Ordering::Relaxed);
        } else {
            self.last_fetched.store(time, Ordering::Relaxed);
            self.fetched.store(true, Ordering::Release);
        }
    }

    fn check_block(
        &self,
        layout: FrameLayout,
        buffer_count: usize,
        buffer_len: impl Fn(usize) -> usize,
        frame_count: usize,
    ) -> Result<(), RelayError> {
        if frame_count == 0 {
            return Err(RelayError::ZeroFrames);
        }
        if layout != self.format.layout {
            return Err(RelayError::LayoutMismatch {
                expected: self.format.layout,
                actual: layout,
            });
        }
        let expected = self.format.buffer_count();
        if buffer_count != expected {
            return Err(RelayError::BufferCountMismatch {
                expected,
                actual: buffer_count,
            });
        }
        let required = frame_count
            .checked_mul(self.bytes_per_slot)
            .unwrap_or(usize::MAX);
        for index in 0..buffer_count {
            let actual = buffer_len(index);
            if actual < required {
                return Err(RelayError::BufferTooSmall {
                    index,
                    required,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// 一个 buffer 中从 `time` 开始的连续槽位，环绕时拆成两段
    #[inline]
    fn slot_chunks(&self, buffer: usize, time: SampleTime, frames: usize) -> [Range<usize>; 2] {
        debug_assert!(frames <= self.capacity, "chunk larger than capacity");
        let bps = self.bytes_per_slot;
        let base = buffer * self.buffer_bytes;
        let slot = time.rem_euclid(self.capacity as i64) as usize;
        let tail = frames.min(self.capacity - slot);
        let head = frames - tail;
        [
            base + slot * bps..base + (slot + tail) * bps,
            base..base + head * bps,
        ]
    }

    fn copy_in(
        &self,
        frames: &FrameBlock<'_>,
        block_start: SampleTime,
        write_start: SampleTime,
        write_end: SampleTime,
    ) {
        let bps = self.bytes_per_slot;
        let skip = (write_start - block_start) as usize;
        let len = (write_end - write_start) as usize;
        for buffer in 0..self.format.buffer_count() {
            let mut src = &frames.buffer(buffer)[skip * bps..(skip + len) * bps];
            for chunk in self.slot_chunks(buffer, write_start, len) {
                let (head, rest) = src.split_at(chunk.len());
                for (cell, &byte) in self.storage[chunk].iter().zip(head) {
                    cell.store(byte, Ordering::Relaxed);
                }
                src = rest;
            }
        }
    }

    fn copy_out(&self, buffer: usize, time: SampleTime, dst: &mut [u8]) {
        let frames = dst.len() / self.bytes_per_slot;
        let mut dst = dst;
        for chunk in self.slot_chunks(buffer, time, frames) {
            let (head, rest) = std::mem::take(&mut dst).split_at_mut(chunk.len());
            for (byte, cell) in head.iter_mut().zip(self.storage[chunk].iter()) {
                *byte = cell.load(Ordering::Relaxed);
            }
            dst = rest;
        }
    }

    fn zero_slots(&self, buffer: usize, time: SampleTime, frames: usize) {
        for chunk in self.slot_chunks(buffer, time, frames) {
            for cell in self.storage[chunk].iter() {
                cell.store(0, Ordering::Relaxed);
            }
        }
    }

    /// 输出块中第 `offset` 帧起的 `frames` 帧写零
    fn zero_out(&self, out: &mut FrameBlockMut<'_, '_>, offset: usize, frames: usize) {
        if frames == 0 {
            return;
        }
        let bps = self.bytes_per_slot;
        for buffer in 0..self.format.buffer_count() {
            out.buffer_mut(buffer)[offset * bps..(offset + frames) * bps].fill(0);
        }
    }
}

impl Drop for TimeRingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
