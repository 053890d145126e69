//! 数据报通道（UDP）
//!
//! 建立在 renet 之上：netcode 负责握手和保活，renet 负责按通道的可靠/不可靠投递，
//! 本通道只把连接状态翻译成状态机调用。没有自己的后台线程，
//! 传输层在 `update` 中按帧时间同步推进；只有主机名解析放到运行时上执行。

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use renet::{
    ChannelConfig, ConnectionConfig, DisconnectReason as RenetDisconnectReason, RenetClient,
    SendType,
};
use renet_netcode::{
    ClientAuthentication, NetcodeClientTransport, NetcodeDisconnectReason, NetcodeTransportError,
};
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ChannelCore, ChannelKind, ChannelState, NetworkChannel};
use crate::config::{secs, DatagramConfig};
use crate::constants::HEARTBEAT_MESSAGE_ID;
use crate::error::{NetError, Result};
use crate::event::DisconnectReason;
use crate::message::NetMessage;
use crate::packet::{decode_message_frame, encode_message_frame, MessageId};
use crate::transport::resolve;

/// 每个 renet 通道最多占用的发送/接收内存
const CHANNEL_MEMORY: usize = 5 * 1024 * 1024;

type Resolved = (u64, std::result::Result<SocketAddr, String>);

/// 单条消息的投递方式，每种对应一个 renet 通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DeliveryMethod {
    /// 不保证送达和顺序，适合持续刷新的状态（位置同步等）
    Unreliable,
    /// 保证送达，不保证顺序
    ReliableUnordered,
    #[default]
    ReliableOrdered,
}

impl DeliveryMethod {
    pub const ALL: [DeliveryMethod; 3] = [
        DeliveryMethod::ReliableOrdered,
        DeliveryMethod::ReliableUnordered,
        DeliveryMethod::Unreliable,
    ];

    pub fn channel_id(self) -> u8 {
        match self {
            DeliveryMethod::ReliableOrdered => 0,
            DeliveryMethod::ReliableUnordered => 1,
            DeliveryMethod::Unreliable => 2,
        }
    }
}

impl From<DeliveryMethod> for u8 {
    fn from(method: DeliveryMethod) -> Self {
        method.channel_id()
    }
}

fn channels_config(resend_interval: f32) -> Vec<ChannelConfig> {
    let resend_time = secs(resend_interval);
    DeliveryMethod::ALL
        .into_iter()
        .map(|method| ChannelConfig {
            channel_id: method.channel_id(),
            max_memory_usage_bytes: CHANNEL_MEMORY,
            send_type: match method {
                DeliveryMethod::Unreliable => SendType::Unreliable,
                DeliveryMethod::ReliableUnordered => SendType::ReliableUnordered { resend_time },
                DeliveryMethod::ReliableOrdered => SendType::ReliableOrdered { resend_time },
            },
        })
        .collect()
}

/// 客户端和服务端共用的 renet 连接配置
pub fn connection_config(resend_interval: f32) -> ConnectionConfig {
    ConnectionConfig {
        server_channels_config: channels_config(resend_interval),
        client_channels_config: channels_config(resend_interval),
        ..ConnectionConfig::default()
    }
}

/// 握手密钥映射为 netcode 协议号（FNV-1a）
pub fn protocol_id(connection_key: &str) -> u64 {
    connection_key
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        })
}

/// netcode 断开原因归一化
pub fn reason_from_netcode(reason: NetcodeDisconnectReason) -> DisconnectReason {
    match reason {
        NetcodeDisconnectReason::DisconnectedByServer => DisconnectReason::ServerClosed,
        NetcodeDisconnectReason::DisconnectedByClient => DisconnectReason::Manual,
        NetcodeDisconnectReason::ConnectionDenied => DisconnectReason::Kicked,
        NetcodeDisconnectReason::ConnectionTimedOut
        | NetcodeDisconnectReason::ConnectionRequestTimedOut
        | NetcodeDisconnectReason::ConnectionResponseTimedOut
        | NetcodeDisconnectReason::ConnectTokenExpired => DisconnectReason::Timeout,
    }
}

fn reason_from_renet(reason: RenetDisconnectReason) -> DisconnectReason {
    match reason {
        RenetDisconnectReason::DisconnectedByServer => DisconnectReason::ServerClosed,
        RenetDisconnectReason::DisconnectedByClient => DisconnectReason::Manual,
        RenetDisconnectReason::Transport => DisconnectReason::NetworkError,
        // 通道与序列化错误
        _ => DisconnectReason::ProtocolError,
    }
}

/// 连接结束的原因及说明
struct Closed {
    reason: DisconnectReason,
    detail: String,
}

impl Closed {
    fn of(session: &Session) -> Self {
        if let Some(reason) = session.transport.disconnect_reason() {
            let detail = format!("{:?}", reason);
            return Self {
                reason: reason_from_netcode(reason),
                detail,
            };
        }
        let reason = session.client.disconnect_reason();
        let detail = format!("{:?}", reason);
        Self {
            reason: reason
                .map(reason_from_renet)
                .unwrap_or(DisconnectReason::Unknown),
            detail,
        }
    }
}

/// 一次连接尝试的 renet 客户端与 netcode 传输
struct Session {
    client: RenetClient,
    transport: NetcodeClientTransport,
    /// 握手已耗时（秒）
    handshake_elapsed: f32,
}

impl Session {
    fn open(addr: SocketAddr, config: &DatagramConfig) -> Result<Self> {
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let authentication = ClientAuthentication::Unsecure {
            protocol_id: protocol_id(&config.connection_key),
            client_id: now.as_nanos() as u64,
            server_addr: addr,
            user_data: None,
        };
        let transport = NetcodeClientTransport::new(now, authentication, socket)?;
        Ok(Self {
            client: RenetClient::new(connection_config(config.resend_interval)),
            transport,
            handshake_elapsed: 0.0,
        })
    }
}

/// UDP 通道
pub struct DatagramChannel {
    core: ChannelCore,
    config: DatagramConfig,
    runtime: Handle,
    session: Option<Session>,
    resolving: Option<JoinHandle<()>>,
    resolved_tx: std_mpsc::Sender<Resolved>,
    resolved_rx: std_mpsc::Receiver<Resolved>,
}

impl DatagramChannel {
    pub fn new(config: DatagramConfig, runtime: Handle) -> Self {
        let (resolved_tx, resolved_rx) = std_mpsc::channel();
        Self {
            core: ChannelCore::new(
                config.name.clone(),
                ChannelKind::Datagram,
                config.reconnect.clone(),
            ),
            config,
            runtime,
            session: None,
            resolving: None,
            resolved_tx,
            resolved_rx,
        }
    }

    pub fn config(&self) -> &DatagramConfig {
        &self.config
    }

    /// 当前连接的往返时间
    pub fn rtt(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .filter(|session| session.client.is_connected())
            .map(|session| Duration::from_secs_f64(session.client.rtt().max(0.0)))
    }

    /// 以指定投递方式编码并发送
    pub fn send_with<T: NetMessage>(
        &mut self,
        message_id: MessageId,
        msg: &T,
        method: DeliveryMethod,
    ) -> bool {
        match msg.to_bytes() {
            Ok(body) => self.send_bytes_with(message_id, &body, method),
            Err(e) => {
                warn!(
                    "[{}] failed to encode message {}: {}",
                    self.core.name(),
                    message_id,
                    e
                );
                false
            }
        }
    }

    /// 以指定投递方式发送已编码的消息体
    ///
    /// 消息先进入 renet 的通道队列，下一次 `update` 时发出。
    pub fn send_bytes_with(
        &mut self,
        message_id: MessageId,
        body: &[u8],
        method: DeliveryMethod,
    ) -> bool {
        if message_id == HEARTBEAT_MESSAGE_ID {
            warn!(
                "[{}] message id {} is reserved",
                self.core.name(),
                HEARTBEAT_MESSAGE_ID
            );
            return false;
        }
        if !self.core.can_send(message_id) {
            return false;
        }
        if body.len() > self.config.max_message_size {
            warn!(
                "[{}] message {} too large: {} bytes (max: {})",
                self.core.name(),
                message_id,
                body.len(),
                self.config.max_message_size
            );
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let frame = encode_message_frame(message_id, body);
        if !session.client.can_send_message(method, frame.len()) {
            warn!(
                "[{}] {:?} queue is full, message {} dropped",
                self.core.name(),
                method,
                message_id
            );
            return false;
        }
        session.client.send_message(method, frame);
        true
    }

    /// 启动一次连接尝试：IP 字面量直接握手，主机名先解析
    fn start_attempt(&mut self) {
        self.teardown();
        let generation = self.core.next_generation();
        let Some(endpoint) = self.core.endpoint().cloned() else {
            self.core.on_connect_failed("no endpoint");
            return;
        };

        if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
            self.open_session(SocketAddr::new(ip, endpoint.port));
            return;
        }

        let tx = self.resolved_tx.clone();
        let limit = secs(self.config.connect_timeout);
        self.resolving = Some(self.runtime.spawn(async move {
            let result = match tokio::time::timeout(limit, resolve(&endpoint.host, endpoint.port))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(NetError::ConnectionTimeout),
            };
            let _ = tx.send((generation, result.map_err(|e| e.to_string())));
        }));
    }

    fn open_session(&mut self, addr: SocketAddr) {
        match Session::open(addr, &self.config) {
            Ok(session) => {
                debug!("[{}] handshaking with {}", self.core.name(), addr);
                self.session = Some(session);
            }
            Err(e) => self.core.on_connect_failed(&e.to_string()),
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.resolving.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            // 立即发出断开包
            session.transport.disconnect();
        }
    }

    fn drain_resolved(&mut self) {
        while let Ok((generation, result)) = self.resolved_rx.try_recv() {
            if generation != self.core.generation() {
                continue;
            }
            self.resolving = None;
            match result {
                Ok(addr) => {
                    debug!("[{}] resolved to {}", self.core.name(), addr);
                    self.open_session(addr);
                }
                Err(error) => self.core.on_connect_failed(&error),
            }
        }
    }

    /// 推进传输层一帧：收包、更新连接状态、取出消息、发包
    fn poll_session(&mut self, dt: f32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let delta = secs(dt);
        session.client.update(delta);

        let mut closed = None;
        if let Err(e) = session.transport.update(delta, &mut session.client) {
            match e {
                NetcodeTransportError::IO(e) => {
                    closed = Some(Closed {
                        reason: DisconnectReason::NetworkError,
                        detail: e.to_string(),
                    });
                }
                other => debug!("[{}] transport: {}", self.core.name(), other),
            }
        }

        let mut frames = Vec::new();
        if session.client.is_connected() {
            if self.core.state() == ChannelState::Connecting {
                self.core.on_connected();
            }
            for method in DeliveryMethod::ALL {
                while let Some(frame) = session.client.receive_message(method) {
                    frames.push(frame);
                }
            }
        } else {
            session.handshake_elapsed += dt;
        }

        if closed.is_none() {
            if session.client.is_disconnected() {
                closed = Some(Closed::of(session));
            } else if self.core.state() == ChannelState::Connecting
                && session.handshake_elapsed >= self.config.connect_timeout
            {
                closed = Some(Closed {
                    reason: DisconnectReason::Timeout,
                    detail: "handshake timed out".to_string(),
                });
            } else if let Err(e) = session.transport.send_packets(&mut session.client) {
                debug!("[{}] send packets: {}", self.core.name(), e);
            }
        }

        for frame in frames {
            self.on_frame(&frame);
        }
        if let Some(closed) = closed {
            self.teardown();
            self.on_closed(closed);
        }
    }

    fn on_closed(&mut self, closed: Closed) {
        if self.core.state() == ChannelState::Connecting {
            self.core.on_connect_failed(&closed.detail);
            return;
        }
        debug!("[{}] connection closed: {}", self.core.name(), closed.detail);
        self.core.on_lost(closed.reason);
    }

    /// 畸形消息只丢弃，不断开
    fn on_frame(&mut self, frame: &[u8]) {
        match decode_message_frame(frame, self.config.max_message_size) {
            Ok(packet) if packet.message_id == HEARTBEAT_MESSAGE_ID => {}
            Ok(packet) => {
                self.core.dispatch(packet);
            }
            Err(e) => debug!("[{}] dropping datagram: {}", self.core.name(), e),
        }
    }
}

impl NetworkChannel for DatagramChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    fn connect(&mut self, host: &str, port: u16) {
        if self.core.begin_connect(host, port) {
            self.start_attempt();
        }
    }

    fn disconnect(&mut self) {
        if !self.core.begin_disconnect() {
            return;
        }
        self.teardown();
        self.core.finish_disconnect();
    }

    fn send_bytes(&mut self, message_id: MessageId, body: &[u8]) -> bool {
        self.send_bytes_with(message_id, body, self.config.default_delivery)
    }

    fn update(&mut self, dt: f32, _real_dt: f32) {
        self.drain_resolved();
        self.poll_session(dt);
        if self.core.tick_reconnect(dt).is_some() {
            self.start_attempt();
        }
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}
