//! 连接生命周期事件
//!
//! 通道只负责把事件排进自己的待发队列，由管理器统一通过 [`EventBus`] 发出。

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc as std_mpsc;

use tokio::sync::broadcast;

use crate::channel::ChannelKind;

/// 断开原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// 主动断开，不会触发重连
    Manual,
    /// 服务端关闭连接
    ServerClosed,
    /// 被服务端踢下线
    Kicked,
    /// 网络 IO 失败
    NetworkError,
    /// 心跳超时
    Timeout,
    /// 帧格式非法或超限
    ProtocolError,
    /// 无法归类的原因
    Unknown,
}

impl DisconnectReason {
    /// 是否允许自动重连
    pub fn allows_reconnect(self) -> bool {
        !matches!(self, DisconnectReason::Manual | DisconnectReason::Kicked)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Manual => "manual",
            DisconnectReason::ServerClosed => "server closed",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// 网络生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// 连接成功
    Connected {
        channel: ChannelKind,
        host: String,
        port: u16,
    },
    /// 连接断开
    Disconnected {
        channel: ChannelKind,
        reason: DisconnectReason,
    },
    /// 首次连接失败
    ConnectFailed { channel: ChannelKind, error: String },
    /// 不致命的错误
    Error { channel: ChannelKind, message: String },
    /// 开始第 `attempt` 次重连
    Reconnecting {
        channel: ChannelKind,
        attempt: u32,
        max_attempts: u32,
    },
    /// 重连成功
    Reconnected { channel: ChannelKind },
    /// 重连次数耗尽
    ReconnectFailed { channel: ChannelKind },
}

impl NetworkEvent {
    /// 事件来源通道
    pub fn channel(&self) -> ChannelKind {
        match self {
            NetworkEvent::Connected { channel, .. }
            | NetworkEvent::Disconnected { channel, .. }
            | NetworkEvent::ConnectFailed { channel, .. }
            | NetworkEvent::Error { channel, .. }
            | NetworkEvent::Reconnecting { channel, .. }
            | NetworkEvent::Reconnected { channel }
            | NetworkEvent::ReconnectFailed { channel } => *channel,
        }
    }
}

/// 外部发布/订阅设施
pub trait EventBus {
    /// 发布一个事件
    fn publish(&mut self, event: NetworkEvent);
}

impl EventBus for std_mpsc::Sender<NetworkEvent> {
    fn publish(&mut self, event: NetworkEvent) {
        // 订阅方已经退出时直接丢弃
        let _ = self.send(event);
    }
}

impl EventBus for broadcast::Sender<NetworkEvent> {
    fn publish(&mut self, event: NetworkEvent) {
        let _ = self.send(event);
    }
}

/// 内存事件队列，供轮询式消费者使用
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<NetworkEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出所有已发布的事件
    pub fn drain(&mut self) -> Vec<NetworkEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventBus for EventQueue {
    fn publish(&mut self, event: NetworkEvent) {
        self.events.push_back(event);
    }
}
