//! 消息式通道（WebSocket）
//!
//! 每条业务消息是一个二进制帧 `[MessageId:2B LE][Body]`，分帧由 WebSocket 负责。
//! 会话结构与流式通道一致：会话任务握手后拆成读写两半，
//! 结果经 `std::sync::mpsc` 交回 `update`。
//!
//! 心跳只有一次超时机会：超过 `heartbeat.timeout` 没有任何入站流量即断开。

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ChannelCore, ChannelKind, ChannelState, Heartbeat, NetworkChannel};
use crate::config::{secs, MessageConfig};
use crate::error::NetError;
use crate::event::DisconnectReason;
use crate::packet::{decode_message_frame, encode_message_frame, MessageId, ReceivedPacket};
use crate::transport::{connect_websocket, WsStream};

/// 主动关闭时等待服务端回应 Close 的时长
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// 把 WebSocket 关闭码归一化为断开原因
pub fn reason_from_close_code(code: CloseCode) -> DisconnectReason {
    match code {
        CloseCode::Normal => DisconnectReason::Manual,
        CloseCode::Away => DisconnectReason::ServerClosed,
        CloseCode::Abnormal => DisconnectReason::NetworkError,
        _ => DisconnectReason::Unknown,
    }
}

#[derive(Debug)]
enum Inbound {
    Connected,
    ConnectFailed(String),
    Packet(ReceivedPacket),
    /// 非业务帧（Ping/Pong/Text），只用于刷新心跳
    Traffic,
    Lost {
        reason: DisconnectReason,
        detail: String,
    },
}

type InboundTx = std_mpsc::Sender<(u64, Inbound)>;

struct Session {
    generation: u64,
    send_tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl Session {
    fn close(self) {
        drop(self.send_tx);
        self.task.abort();
    }

    /// 发送 Close 帧后让会话自行结束，超时仍未结束则取消
    fn close_gracefully(self, runtime: &Handle) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        let _ = self.send_tx.send(Message::Close(Some(frame)));
        drop(self.send_tx);
        let task = self.task;
        runtime.spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            task.abort();
        });
    }
}

/// WebSocket 通道
pub struct MessageChannel {
    core: ChannelCore,
    config: MessageConfig,
    runtime: Handle,
    heartbeat: Heartbeat,
    session: Option<Session>,
    inbound_tx: InboundTx,
    inbound_rx: std_mpsc::Receiver<(u64, Inbound)>,
}

impl MessageChannel {
    pub fn new(config: MessageConfig, runtime: Handle) -> Self {
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        // 只看一次超时
        let mut heartbeat_config = config.heartbeat.clone();
        heartbeat_config.max_timeouts = 1;
        Self {
            core: ChannelCore::new(
                config.name.clone(),
                ChannelKind::Message,
                config.reconnect.clone(),
            ),
            heartbeat: Heartbeat::new(heartbeat_config),
            config,
            runtime,
            session: None,
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn config(&self) -> &MessageConfig {
        &self.config
    }

    /// 当前（或最近一次）连接的 URL
    pub fn url(&self) -> Option<String> {
        self.core
            .endpoint()
            .map(|e| self.config.url(&e.host, e.port))
    }

    fn start_session(&mut self) {
        self.teardown();
        let generation = self.core.next_generation();
        let Some(url) = self.url() else {
            self.core.on_connect_failed("no endpoint");
            return;
        };

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(run_session(
            generation,
            url,
            secs(self.config.connect_timeout),
            self.config.max_message_size,
            send_rx,
            self.inbound_tx.clone(),
        ));
        self.session = Some(Session {
            generation,
            send_tx,
            task,
        });
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                "[{}] closing session {}",
                self.core.name(),
                session.generation
            );
            session.close();
        }
    }

    fn lose(&mut self, reason: DisconnectReason) {
        self.teardown();
        self.core.on_lost(reason);
    }

    fn enqueue(&mut self, message: Message) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if session.send_tx.send(message).is_err() {
            debug!("[{}] send queue closed", self.core.name());
            return false;
        }
        self.heartbeat.on_sent();
        true
    }

    fn send_heartbeat(&mut self) {
        let message = match self.config.heartbeat_message_id {
            Some(id) => Message::Binary(encode_message_frame(id, &[])),
            None => Message::Ping(Vec::new()),
        };
        self.enqueue(message);
    }

    fn drain_inbound(&mut self) {
        while let Ok((generation, inbound)) = self.inbound_rx.try_recv() {
            if generation != self.core.generation() {
                continue;
            }
            match inbound {
                Inbound::Connected => {
                    self.heartbeat.reset();
                    self.core.on_connected();
                }
                Inbound::ConnectFailed(error) => {
                    self.teardown();
                    self.core.on_connect_failed(&error);
                }
                Inbound::Packet(packet) => {
                    self.heartbeat.on_received();
                    if Some(packet.message_id) != self.config.heartbeat_message_id {
                        self.core.dispatch(packet);
                    }
                }
                Inbound::Traffic => self.heartbeat.on_received(),
                Inbound::Lost { reason, detail } => {
                    if !matches!(
                        reason,
                        DisconnectReason::ServerClosed | DisconnectReason::Manual
                    ) {
                        self.core.on_error(detail);
                    }
                    self.lose(reason);
                }
            }
        }
    }
}

impl NetworkChannel for MessageChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    fn connect(&mut self, host: &str, port: u16) {
        if self.core.begin_connect(host, port) {
            self.start_session();
        }
    }

    fn disconnect(&mut self) {
        if !self.core.begin_disconnect() {
            return;
        }
        if let Some(session) = self.session.take() {
            session.close_gracefully(&self.runtime);
        }
        self.core.finish_disconnect();
    }

    fn send_bytes(&mut self, message_id: MessageId, body: &[u8]) -> bool {
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
        self.enqueue(Message::Binary(encode_message_frame(message_id, body)))
    }

    fn update(&mut self, dt: f32, _real_dt: f32) {
        self.drain_inbound();

        if self.core.state() == ChannelState::Connected {
            let tick = self.heartbeat.tick(dt);
            if tick.expired {
                warn!("[{}] heartbeat timed out", self.core.name());
                self.lose(DisconnectReason::Timeout);
            } else if tick.send {
                self.send_heartbeat();
            }
        }

        if self.core.tick_reconnect(dt).is_some() {
            self.start_session();
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_session(
    generation: u64,
    url: String,
    connect_timeout: Duration,
    max_body: usize,
    send_rx: mpsc::UnboundedReceiver<Message>,
    inbound_tx: InboundTx,
) {
    let ws = match connect_websocket(&url, connect_timeout).await {
        Ok(ws) => ws,
        Err(e) => {
            let _ = inbound_tx.send((generation, Inbound::ConnectFailed(e.to_string())));
            return;
        }
    };
    info!("WebSocket session {} established with {}", generation, url);
    if inbound_tx.send((generation, Inbound::Connected)).is_err() {
        return;
    }

    let (sink, stream) = ws.split();
    let mut tasks = JoinSet::new();
    tasks.spawn(read_loop(stream, max_body, generation, inbound_tx.clone()));
    tasks.spawn(write_loop(sink, send_rx, generation, inbound_tx));

    // 发送队列正常关闭说明是主动断开，继续读到服务端的 Close 回应为止
    if let Some(Ok(true)) = tasks.join_next().await {
        tasks.join_next().await;
    }
}

/// 接收循环，返回 false
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    max_body: usize,
    generation: u64,
    inbound_tx: InboundTx,
) -> bool {
    let send = |inbound| inbound_tx.send((generation, inbound)).is_ok();
    let lost = |reason, detail: String| {
        let _ = inbound_tx.send((generation, Inbound::Lost { reason, detail }));
    };

    while let Some(message) = stream.next().await {
        let inbound = match message {
            Ok(Message::Binary(data)) => match decode_message_frame(&data, max_body) {
                Ok(packet) => Inbound::Packet(packet),
                Err(e) => {
                    lost(DisconnectReason::ProtocolError, e.to_string());
                    return false;
                }
            },
            Ok(Message::Close(frame)) => {
                let (reason, detail) = close_outcome(frame.as_ref());
                debug!("WebSocket session {}: {}", generation, detail);
                lost(reason, detail);
                return false;
            }
            Ok(Message::Text(_)) => {
                debug!("WebSocket session {}: ignoring text frame", generation);
                Inbound::Traffic
            }
            Ok(_) => Inbound::Traffic,
            Err(e) => {
                lost(DisconnectReason::NetworkError, format!("receive failed: {}", e));
                return false;
            }
        };
        if !send(inbound) {
            return false;
        }
    }

    lost(
        DisconnectReason::NetworkError,
        NetError::ConnectionClosed.to_string(),
    );
    false
}

/// 服务端 Close 帧对应的断开原因；不带状态码（1005）的按未知处理
fn close_outcome(frame: Option<&CloseFrame>) -> (DisconnectReason, String) {
    match frame {
        Some(frame) => (
            reason_from_close_code(frame.code),
            format!("closed by server: {} {}", frame.code, frame.reason),
        ),
        None => (
            DisconnectReason::Unknown,
            "closed by server without status code".to_string(),
        ),
    }
}

/// 发送循环，发送队列被关闭时返回 true
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut send_rx: mpsc::UnboundedReceiver<Message>,
    generation: u64,
    inbound_tx: InboundTx,
) -> bool {
    while let Some(message) = send_rx.recv().await {
        if let Err(e) = sink.send(message).await {
            let _ = inbound_tx.send((
                generation,
                Inbound::Lost {
                    reason: DisconnectReason::NetworkError,
                    detail: format!("send failed: {}", e),
                },
            ));
            return false;
        }
    }
    true
}
