//! 消息处理器注册表

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, warn};

use crate::message::NetMessage;
use crate::packet::{MessageId, ReceivedPacket};

type Handler = Box<dyn FnMut(&[u8]) -> Dispatch + Send>;

/// 单条消息的分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 处理器正常执行
    Handled,
    /// 没有注册处理器，消息被丢弃
    Unhandled,
    /// 消息体解码失败，消息被丢弃
    DecodeFailed,
    /// 处理器 panic，已被捕获
    HandlerPanicked,
}

/// 消息 ID 到（解码器 + 回调）的映射
///
/// 每个 ID 至多一个处理器，重复注册会覆盖。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageId, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，返回是否覆盖了旧的注册
    pub fn register<T, F>(&mut self, message_id: MessageId, mut callback: F) -> bool
    where
        T: NetMessage,
        F: FnMut(T) + Send + 'static,
    {
        let handler: Handler = Box::new(move |body| match T::parse_from(body) {
            Ok(msg) => match panic::catch_unwind(AssertUnwindSafe(|| callback(msg))) {
                Ok(()) => Dispatch::Handled,
                Err(_) => Dispatch::HandlerPanicked,
            },
            Err(e) => {
                warn!("Failed to decode message {}: {}", message_id, e);
                Dispatch::DecodeFailed
            }
        });
        let replaced = self.handlers.insert(message_id, handler).is_some();
        if replaced {
            debug!("Handler for message {} replaced", message_id);
        }
        replaced
    }

    /// 移除处理器
    pub fn unregister(&mut self, message_id: MessageId) -> bool {
        self.handlers.remove(&message_id).is_some()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.handlers.contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 解码并分发一条消息
    ///
    /// 解码失败和处理器 panic 只影响这一条消息。
    pub fn unpack(&mut self, packet: ReceivedPacket) -> Dispatch {
        let Some(handler) = self.handlers.get_mut(&packet.message_id) else {
            debug!(
                "No handler for message {} ({} bytes), dropped",
                packet.message_id,
                packet.body_len()
            );
            return Dispatch::Unhandled;
        };
        let outcome = handler(&packet.body);
        if outcome == Dispatch::HandlerPanicked {
            error!("Handler for message {} panicked", packet.message_id);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Chat {
        text: String,
    }

    impl NetMessage for Chat {}

    fn packet(id: MessageId, msg: &Chat) -> ReceivedPacket {
        ReceivedPacket::new(id, msg.to_bytes().unwrap())
    }

    #[test]
    fn test_dispatch_to_typed_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut registry = HandlerRegistry::new();
        registry.register(10, move |msg: Chat| sink.lock().unwrap().push(msg.text));

        let outcome = registry.unpack(packet(10, &Chat { text: "hi".into() }));
        assert_eq!(outcome, Dispatch::Handled);
        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_reregister_overwrites() {
        let hits = Arc::new(Mutex::new((0, 0)));
        let mut registry = HandlerRegistry::new();
        let first = Arc::clone(&hits);
        assert!(!registry.register(1, move |_: Chat| first.lock().unwrap().0 += 1));
        let second = Arc::clone(&hits);
        assert!(registry.register(1, move |_: Chat| second.lock().unwrap().1 += 1));

        registry.unpack(packet(1, &Chat { text: String::new() }));
        assert_eq!(*hits.lock().unwrap(), (0, 1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let mut registry = HandlerRegistry::new();
        assert_eq!(
            registry.unpack(ReceivedPacket::new(99, vec![1])),
            Dispatch::Unhandled
        );
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let mut registry = HandlerRegistry::new();
        registry.register(2, move |_: Chat| *sink.lock().unwrap() += 1);

        assert_eq!(
            registry.unpack(ReceivedPacket::new(2, vec![0xFF; 9])),
            Dispatch::DecodeFailed
        );
        assert_eq!(
            registry.unpack(packet(2, &Chat { text: "ok".into() })),
            Dispatch::Handled
        );
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_handler_panic_is_caught() {
        let mut registry = HandlerRegistry::new();
        registry.register(3, |msg: Chat| {
            if msg.text == "boom" {
                panic!("handler failure");
            }
        });

        assert_eq!(
            registry.unpack(packet(3, &Chat { text: "boom".into() })),
            Dispatch::HandlerPanicked
        );
        assert_eq!(
            registry.unpack(packet(3, &Chat { text: "fine".into() })),
            Dispatch::Handled
        );
    }

    #[test]
    fn test_unregister() {
        let mut registry = HandlerRegistry::new();
        registry.register(4, |_: Chat| {});
        assert!(registry.unregister(4));
        assert!(!registry.contains(4));
        assert!(!registry.unregister(4));
    }
}
