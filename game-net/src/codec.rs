//! 流式通道帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────────┬──────────────────┬────────────────────────────────┐
//! │ BodyLength (4B)│  MessageId (2B)  │         Body (BodyLength)      │
//! │    i32 LE      │     u16 LE       │         业务消息字节            │
//! └────────────────┴──────────────────┴────────────────────────────────┘
//! ```
//!
//! MessageId 0 保留给心跳，消息体为空。

use serde::Deserialize;

use crate::constants::{
    BUFFER_SHRINK_MULTIPLE, BUFFER_SHRINK_USAGE, MAX_MESSAGE_SIZE, RECEIVE_BUFFER_CEILING,
    RECEIVE_BUFFER_FLOOR, STREAM_HEADER_SIZE,
};
use crate::error::{NetError, Result};
use crate::packet::{MessageId, ReceivedPacket};

/// 编码一帧流式消息
pub fn encode_stream_frame(message_id: MessageId, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(STREAM_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&message_id.to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// 接收缓冲区尺寸限制
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BufferLimits {
    /// 初始容量，收缩不会低于此值
    pub floor: usize,
    /// 容量上限
    pub ceiling: usize,
    /// 单条消息体最大长度
    pub max_body: usize,
    /// 使用率低于此比例时收缩
    pub shrink_usage: f32,
    /// 容量至少为 floor 的多少倍才允许收缩
    pub shrink_multiple: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            floor: RECEIVE_BUFFER_FLOOR,
            ceiling: RECEIVE_BUFFER_CEILING,
            max_body: MAX_MESSAGE_SIZE,
            shrink_usage: BUFFER_SHRINK_USAGE,
            shrink_multiple: BUFFER_SHRINK_MULTIPLE,
        }
    }
}

impl BufferLimits {
    /// 修正互相矛盾的取值：一帧必须能放进上限
    fn normalized(mut self) -> Self {
        self.floor = self.floor.max(STREAM_HEADER_SIZE);
        self.ceiling = self.ceiling.max(self.floor);
        self.max_body = self.max_body.min(self.ceiling - STREAM_HEADER_SIZE);
        self.shrink_multiple = self.shrink_multiple.max(1);
        self
    }
}

/// 可增长、可收缩的接收缓冲区
///
/// 有效数据位于 `data[start..end]`，容量即 `data.len()`。
/// 容量从 floor 起按倍数增长到 ceiling；每次整理后若使用率过低则减半。
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    /// 正在等待的不完整帧的总长度
    pending_frame: usize,
    limits: BufferLimits,
}

impl ReceiveBuffer {
    /// 创建新的接收缓冲区
    pub fn new(limits: BufferLimits) -> Self {
        let limits = limits.normalized();
        Self {
            data: vec![0u8; limits.floor].into_boxed_slice(),
            start: 0,
            end: 0,
            pending_frame: 0,
            limits,
        }
    }

    /// 当前容量
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 已缓冲的字节数
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn limits(&self) -> &BufferLimits {
        &self.limits
    }

    /// 返回可写入的空闲区域，必要时先整理或扩容
    pub fn writable(&mut self) -> Result<&mut [u8]> {
        if self.end == self.capacity() {
            self.compact();
        }
        if self.end == self.capacity() {
            if self.capacity() >= self.limits.ceiling {
                return Err(NetError::FrameTooLarge {
                    size: self.len() + 1,
                    max: self.limits.ceiling,
                });
            }
            self.grow_to(self.capacity() + 1);
        }
        Ok(&mut self.data[self.end..])
    }

    /// 确认写入了 `n` 字节
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.capacity());
        self.end += n;
    }

    /// 追加一段字节（测试与同步场景使用）
    pub fn extend_from_slice(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let spare = self.writable()?;
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.commit(n);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// 取出下一条完整的消息
    ///
    /// 数据不足时返回 `Ok(None)`；长度字段非法或超限返回错误，
    /// 调用方应当断开连接。
    pub fn next_packet(&mut self) -> Result<Option<ReceivedPacket>> {
        if self.len() < STREAM_HEADER_SIZE {
            return Ok(None);
        }

        let head = &self.data[self.start..self.end];
        let raw_len = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if raw_len < 0 {
            return Err(NetError::InvalidBodyLength(raw_len));
        }
        let body_len = raw_len as usize;
        if body_len > self.limits.max_body {
            return Err(NetError::FrameTooLarge {
                size: body_len,
                max: self.limits.max_body,
            });
        }

        let total = STREAM_HEADER_SIZE + body_len;
        if head.len() < total {
            self.pending_frame = total;
            return Ok(None);
        }

        let message_id = MessageId::from_le_bytes([head[4], head[5]]);
        let body = head[STREAM_HEADER_SIZE..total].to_vec();
        self.start += total;
        self.pending_frame = 0;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        Ok(Some(ReceivedPacket::new(message_id, body)))
    }

    /// 取出所有完整消息，然后整理缓冲区
    pub fn drain_packets(&mut self) -> Result<Vec<ReceivedPacket>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        self.settle();
        Ok(packets)
    }

    /// 一轮解析结束后整理：压缩、为等待中的帧预留空间、按需收缩
    pub fn settle(&mut self) {
        self.compact();
        if self.pending_frame > self.capacity() {
            self.grow_to(self.pending_frame);
        }
        self.maybe_shrink();
    }

    /// 丢弃所有数据并恢复到初始容量
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.pending_frame = 0;
        if self.capacity() != self.limits.floor {
            self.data = vec![0u8; self.limits.floor].into_boxed_slice();
        }
    }

    /// 把未读数据移到缓冲区头部
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    fn grow_to(&mut self, needed: usize) {
        let mut capacity = self.capacity().max(1);
        while capacity < needed {
            capacity *= 2;
        }
        self.resize(capacity.min(self.limits.ceiling));
    }

    fn maybe_shrink(&mut self) {
        let capacity = self.capacity();
        if capacity < self.limits.floor * self.limits.shrink_multiple {
            return;
        }
        let threshold = (capacity as f32 * self.limits.shrink_usage) as usize;
        if self.len() >= threshold {
            return;
        }
        let target = (capacity / 2).max(self.limits.floor);
        if target < capacity && target >= self.len().max(self.pending_frame) {
            self.resize(target);
        }
    }

    fn resize(&mut self, capacity: usize) {
        debug_assert!(self.start == 0 && self.end <= capacity);
        let mut data = vec![0u8; capacity].into_boxed_slice();
        data[..self.end].copy_from_slice(&self.data[..self.end]);
        self.data = data;
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}
