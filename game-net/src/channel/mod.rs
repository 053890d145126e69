//! 通道契约
//!
//! 三种传输（流式 / 数据报 / 消息式）实现同一个 [`NetworkChannel`] trait。
//! 状态机、处理器注册表、事件队列和重连记账放在可组合的 [`ChannelCore`] 中，
//! 各通道只负责自己的传输细节。
//!
//! 所有对外可见的状态变化都发生在调用 `update` 的线程上；
//! 后台任务只能通过队列"请求"状态变化。

mod handler;
mod heartbeat;
mod reconnect;

pub mod datagram;
pub mod message;
pub mod stream;

use std::fmt;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::event::{DisconnectReason, NetworkEvent};
use crate::message::NetMessage;
use crate::packet::{MessageId, ReceivedPacket};

pub use handler::{Dispatch, HandlerRegistry};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatTick};
pub use reconnect::{ReconnectConfig, Reconnector, RetryOutcome};

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ChannelKind {
    /// 可靠有序字节流（TCP）
    Stream,
    /// 数据报（UDP）
    Datagram,
    /// 逐条消息（WebSocket）
    Message,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ChannelKind::Stream => "stream",
            ChannelKind::Datagram => "datagram",
            ChannelKind::Message => "message",
        };
        f.write_str(text)
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 远端地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 三种通道共享的状态与记账
pub struct ChannelCore {
    name: String,
    kind: ChannelKind,
    state: ChannelState,
    endpoint: Option<Endpoint>,
    handlers: HandlerRegistry,
    reconnect: Reconnector,
    events: Vec<NetworkEvent>,
    /// 每次建立或拆除会话时递增，用于丢弃旧会话的迟到结果
    generation: u64,
}

impl ChannelCore {
    pub fn new(name: impl Into<String>, kind: ChannelKind, reconnect: ReconnectConfig) -> Self {
        Self {
            name: name.into(),
            kind,
            state: ChannelState::Disconnected,
            endpoint: None,
            handlers: HandlerRegistry::new(),
            reconnect: Reconnector::new(reconnect),
            events: Vec::new(),
            generation: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.reconnect
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 作废当前会话，返回新的代号
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!("[{}] {} -> {}", self.name, self.state, state);
            self.state = state;
        }
    }

    pub fn emit(&mut self, event: NetworkEvent) {
        self.events.push(event);
    }

    /// 取出待发布的事件
    pub fn take_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }

    /// 显式 connect 的入口检查
    ///
    /// 只有 Disconnected 状态可以连接，成功时进入 Connecting 并重置重连状态。
    pub fn begin_connect(&mut self, host: &str, port: u16) -> bool {
        if self.state != ChannelState::Disconnected {
            warn!(
                "[{}] connect({}:{}) ignored in state {}",
                self.name, host, port, self.state
            );
            return false;
        }
        self.reconnect.reset();
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
        });
        self.set_state(ChannelState::Connecting);
        info!("[{}] connecting to {}:{}", self.name, host, port);
        true
    }

    /// 发送前检查
    pub fn can_send(&self, message_id: MessageId) -> bool {
        if self.state != ChannelState::Connected {
            debug!(
                "[{}] send({}) dropped in state {}",
                self.name, message_id, self.state
            );
            return false;
        }
        true
    }

    /// 连接建立
    pub fn on_connected(&mut self) {
        self.set_state(ChannelState::Connected);
        let reconnected = self.reconnect.on_connected();
        let (host, port) = self
            .endpoint
            .as_ref()
            .map(|e| (e.host.clone(), e.port))
            .unwrap_or_default();
        info!("[{}] connected to {}:{}", self.name, host, port);
        self.emit(NetworkEvent::Connected {
            channel: self.kind,
            host,
            port,
        });
        if reconnected {
            info!("[{}] reconnected", self.name);
            self.emit(NetworkEvent::Reconnected { channel: self.kind });
        }
    }

    /// 连接尝试失败
    ///
    /// 首次连接只报告 ConnectFailed；重连流程中的失败进入下一轮退避。
    pub fn on_connect_failed(&mut self, error: &str) {
        self.set_state(ChannelState::Disconnected);
        if !self.reconnect.is_reconnecting() {
            warn!("[{}] connect failed: {}", self.name, error);
            self.emit(NetworkEvent::ConnectFailed {
                channel: self.kind,
                error: error.to_string(),
            });
            return;
        }

        let attempt = self.reconnect.attempt();
        match self.reconnect.on_attempt_failed() {
            RetryOutcome::Retry => {
                info!(
                    "[{}] reconnect attempt {} failed: {}, retrying in {}s",
                    self.name,
                    attempt,
                    error,
                    self.reconnect.config().interval
                );
            }
            RetryOutcome::Exhausted => {
                warn!(
                    "[{}] reconnect failed after {} attempts: {}",
                    self.name, attempt, error
                );
                self.emit(NetworkEvent::ReconnectFailed { channel: self.kind });
            }
        }
    }

    /// 连接意外丢失，所有致命错误都走这里
    pub fn on_lost(&mut self, reason: DisconnectReason) {
        self.next_generation();
        self.set_state(ChannelState::Disconnected);
        warn!("[{}] disconnected: {}", self.name, reason);
        self.emit(NetworkEvent::Disconnected {
            channel: self.kind,
            reason,
        });
        if self.reconnect.schedule(reason) {
            info!(
                "[{}] will reconnect in {}s",
                self.name,
                self.reconnect.config().interval
            );
        }
    }

    /// 报告一个不致命的错误
    pub fn on_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}] error: {}", self.name, message);
        self.emit(NetworkEvent::Error {
            channel: self.kind,
            message,
        });
    }

    /// 主动断开的前半段，返回是否有活动会话需要拆除
    ///
    /// 退避等待中的主动断开只取消后续重试。
    pub fn begin_disconnect(&mut self) -> bool {
        match self.state {
            ChannelState::Connected | ChannelState::Connecting => {
                self.reconnect.cancel();
                self.set_state(ChannelState::Disconnecting);
                true
            }
            ChannelState::Disconnected if self.reconnect.is_waiting() => {
                info!("[{}] reconnect cancelled", self.name);
                self.reconnect.cancel();
                false
            }
            _ => {
                debug!("[{}] disconnect ignored in state {}", self.name, self.state);
                false
            }
        }
    }

    /// 主动断开的后半段：会话已拆除
    pub fn finish_disconnect(&mut self) {
        self.next_generation();
        self.set_state(ChannelState::Disconnected);
        info!("[{}] disconnected: {}", self.name, DisconnectReason::Manual);
        self.emit(NetworkEvent::Disconnected {
            channel: self.kind,
            reason: DisconnectReason::Manual,
        });
    }

    /// 推进重连等待，到点时进入 Connecting 并返回重试序号
    pub fn tick_reconnect(&mut self, dt: f32) -> Option<u32> {
        if self.state != ChannelState::Disconnected {
            return None;
        }
        let attempt = self.reconnect.tick(dt)?;
        let max_attempts = self.reconnect.max_attempts();
        info!(
            "[{}] reconnecting ({}/{})",
            self.name, attempt, max_attempts
        );
        self.emit(NetworkEvent::Reconnecting {
            channel: self.kind,
            attempt,
            max_attempts,
        });
        self.set_state(ChannelState::Connecting);
        Some(attempt)
    }

    /// 分发一条消息
    pub fn dispatch(&mut self, packet: ReceivedPacket) -> Dispatch {
        self.handlers.unpack(packet)
    }
}

/// 三种通道的统一接口
///
/// `update` 必须在宿主每帧调用一次，它是唯一分发入站消息的地方，
/// 因此处理器总在调用方线程上执行。
pub trait NetworkChannel: Send {
    fn core(&self) -> &ChannelCore;

    fn core_mut(&mut self) -> &mut ChannelCore;

    /// 连接服务器，仅在 Disconnected 状态下有效
    fn connect(&mut self, host: &str, port: u16);

    /// 主动断开，不会触发自动重连
    fn disconnect(&mut self);

    /// 发送已编码的消息体，未连接时丢弃并返回 false
    fn send_bytes(&mut self, message_id: MessageId, body: &[u8]) -> bool;

    /// 每帧驱动：泵传输层、分发入站消息、推进心跳与重连
    fn update(&mut self, dt: f32, real_dt: f32);

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kind(&self) -> ChannelKind {
        self.core().kind()
    }

    fn state(&self) -> ChannelState {
        self.core().state()
    }

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// 取出待发布的生命周期事件
    fn take_events(&mut self) -> Vec<NetworkEvent> {
        self.core_mut().take_events()
    }

    /// 编码并发送一条消息
    ///
    /// 返回 true 仅表示已进入发送队列，不代表送达。
    fn send<T: NetMessage>(&mut self, message_id: MessageId, msg: &T) -> bool
    where
        Self: Sized,
    {
        match msg.to_bytes() {
            Ok(body) => self.send_bytes(message_id, &body),
            Err(e) => {
                warn!("[{}] failed to encode message {}: {}", self.name(), message_id, e);
                false
            }
        }
    }

    /// 注册消息处理器，覆盖同 ID 的旧注册
    fn register_handler<T, F>(&mut self, message_id: MessageId, callback: F)
    where
        Self: Sized,
        T: NetMessage,
        F: FnMut(T) + Send + 'static,
    {
        self.core_mut().handlers_mut().register(message_id, callback);
    }

    fn unregister_handler(&mut self, message_id: MessageId) -> bool {
        self.core_mut().handlers_mut().unregister(message_id)
    }

    /// 解码并分发一条消息
    fn unpack_packet(&mut self, packet: ReceivedPacket) -> Dispatch {
        self.core_mut().dispatch(packet)
    }
}
