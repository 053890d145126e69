//! 入站消息信封与消息式帧
//!
//! 消息式帧格式（UDP 数据报 / WebSocket 二进制消息）:
//! ```text
//! ┌──────────────────┬────────────────────────────────┐
//! │ MessageId (2B)   │             Body               │
//! │    u16 LE        │   由传输层界定边界，无长度前缀   │
//! └──────────────────┴────────────────────────────────┘
//! ```

use crate::constants::MESSAGE_HEADER_SIZE;
use crate::error::{NetError, Result};

/// 消息 ID
pub type MessageId = u16;

/// 收到的一条消息
///
/// 每条入站消息创建一次，由分发流程消费一次后释放。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub message_id: MessageId,
    pub body: Vec<u8>,
}

impl ReceivedPacket {
    pub fn new(message_id: MessageId, body: Vec<u8>) -> Self {
        Self { message_id, body }
    }

    /// 消息体长度
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

/// 编码一条消息式帧
pub fn encode_message_frame(message_id: MessageId, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + body.len());
    frame.extend_from_slice(&message_id.to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// 解码一条消息式帧
///
/// `max_body` 为允许的最大消息体长度，超出视为协议违规。
pub fn decode_message_frame(frame: &[u8], max_body: usize) -> Result<ReceivedPacket> {
    if frame.len() < MESSAGE_HEADER_SIZE {
        return Err(NetError::TruncatedFrame {
            len: frame.len(),
            min: MESSAGE_HEADER_SIZE,
        });
    }
    let body_len = frame.len() - MESSAGE_HEADER_SIZE;
    if body_len > max_body {
        return Err(NetError::FrameTooLarge {
            size: body_len,
            max: max_body,
        });
    }
    let message_id = MessageId::from_le_bytes([frame[0], frame[1]]);
    Ok(ReceivedPacket::new(
        message_id,
        frame[MESSAGE_HEADER_SIZE..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_frame_layout() {
        let frame = encode_message_frame(1001, b"hi");
        assert_eq!(frame, vec![0xE9, 0x03, b'h', b'i']);
    }

    #[test]
    fn test_message_frame_roundtrip() {
        for (id, body) in [(0u16, Vec::new()), (7, vec![1, 2, 3]), (u16::MAX, vec![0; 300])] {
            let packet = decode_message_frame(&encode_message_frame(id, &body), 1024).unwrap();
            assert_eq!(packet.message_id, id);
            assert_eq!(packet.body_len(), body.len());
            assert_eq!(packet.body, body);
        }
    }

    #[test]
    fn test_message_frame_truncated() {
        assert!(matches!(
            decode_message_frame(&[1], 1024),
            Err(NetError::TruncatedFrame { len: 1, .. })
        ));
    }

    #[test]
    fn test_message_frame_too_large() {
        let frame = encode_message_frame(5, &[0; 17]);
        assert!(matches!(
            decode_message_frame(&frame, 16),
            Err(NetError::FrameTooLarge { size: 17, max: 16 })
        ));
    }
}
