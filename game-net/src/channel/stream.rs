//! 流式通道（TCP）
//!
//! 每次连接启动一个会话任务：先带超时地建连，成功后拆成读写两半，
//! 分别交给接收循环和发送循环。两个循环只做阻塞 IO，结果通过
//! `std::sync::mpsc` 交回 `update` 所在线程，业务分发只在那里发生。
//!
//! ```text
//!  update() ──send_tx──▶ write_loop ──▶ socket
//!  update() ◀─inbound── read_loop  ◀── socket
//! ```

use std::sync::mpsc as std_mpsc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{ChannelCore, ChannelKind, ChannelState, Heartbeat, NetworkChannel};
use crate::codec::{encode_stream_frame, BufferLimits, ReceiveBuffer};
use crate::config::{secs, StreamConfig};
use crate::constants::HEARTBEAT_MESSAGE_ID;
use crate::event::DisconnectReason;
use crate::packet::{MessageId, ReceivedPacket};
use crate::transport::connect_tcp;

/// 后台任务交给 tick 线程的结果
#[derive(Debug)]
enum Inbound {
    Connected,
    ConnectFailed(String),
    Packet(ReceivedPacket),
    Lost {
        reason: DisconnectReason,
        detail: String,
    },
}

type InboundTx = std_mpsc::Sender<(u64, Inbound)>;

/// 一次连接的后台资源
struct Session {
    generation: u64,
    send_tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl Session {
    /// 关闭会话：丢弃发送队列，取消读写任务（socket 随之关闭）
    fn close(self) {
        drop(self.send_tx);
        self.task.abort();
    }
}

/// TCP 通道
pub struct StreamChannel {
    core: ChannelCore,
    config: StreamConfig,
    runtime: Handle,
    heartbeat: Heartbeat,
    session: Option<Session>,
    inbound_tx: InboundTx,
    inbound_rx: std_mpsc::Receiver<(u64, Inbound)>,
}

impl StreamChannel {
    pub fn new(config: StreamConfig, runtime: Handle) -> Self {
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        Self {
            core: ChannelCore::new(
                config.name.clone(),
                ChannelKind::Stream,
                config.reconnect.clone(),
            ),
            heartbeat: Heartbeat::new(config.heartbeat.clone()),
            config,
            runtime,
            session: None,
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 启动一次连接尝试（首次或重连）
    fn start_session(&mut self) {
        self.teardown();
        let generation = self.core.next_generation();
        let Some(endpoint) = self.core.endpoint().cloned() else {
            self.core.on_connect_failed("no endpoint");
            return;
        };

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(run_session(
            generation,
            endpoint.host,
            endpoint.port,
            self.config.clone(),
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

    /// 所有致命错误统一从这里断开
    fn lose(&mut self, reason: DisconnectReason) {
        self.teardown();
        self.core.on_lost(reason);
    }

    fn enqueue(&mut self, frame: Vec<u8>) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if session.send_tx.send(frame).is_err() {
            debug!("[{}] send queue closed", self.core.name());
            return false;
        }
        self.heartbeat.on_sent();
        true
    }

    /// 取出后台结果，按接收顺序处理
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
                    if packet.message_id != HEARTBEAT_MESSAGE_ID {
                        self.core.dispatch(packet);
                    }
                }
                Inbound::Lost { reason, detail } => {
                    if reason != DisconnectReason::ServerClosed {
                        self.core.on_error(detail);
                    }
                    self.lose(reason);
                }
            }
        }
    }
}

impl NetworkChannel for StreamChannel {
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
        self.teardown();
        self.core.finish_disconnect();
    }

    fn send_bytes(&mut self, message_id: MessageId, body: &[u8]) -> bool {
        if message_id == HEARTBEAT_MESSAGE_ID {
            warn!(
                "[{}] message id {} is reserved for heartbeat",
                self.core.name(),
                HEARTBEAT_MESSAGE_ID
            );
            return false;
        }
        if !self.core.can_send(message_id) {
            return false;
        }
        if body.len() > self.config.buffer.max_body {
            warn!(
                "[{}] message {} too large: {} bytes (max: {})",
                self.core.name(),
                message_id,
                body.len(),
                self.config.buffer.max_body
            );
            return false;
        }
        self.enqueue(encode_stream_frame(message_id, body))
    }

    fn update(&mut self, dt: f32, _real_dt: f32) {
        self.drain_inbound();

        if self.core.state() == ChannelState::Connected {
            let tick = self.heartbeat.tick(dt);
            if tick.expired {
                warn!(
                    "[{}] heartbeat timed out {} times",
                    self.core.name(),
                    self.heartbeat.timeouts()
                );
                self.lose(DisconnectReason::Timeout);
            } else if tick.send {
                self.enqueue(encode_stream_frame(HEARTBEAT_MESSAGE_ID, &[]));
            }
        }

        if self.core.tick_reconnect(dt).is_some() {
            self.start_session();
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// 会话任务：建连，然后并行运行读写循环，任一方向结束即整体结束
async fn run_session(
    generation: u64,
    host: String,
    port: u16,
    config: StreamConfig,
    send_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound_tx: InboundTx,
) {
    let stream = match connect_tcp(&host, port, secs(config.connect_timeout), config.nodelay).await
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = inbound_tx.send((generation, Inbound::ConnectFailed(e.to_string())));
            return;
        }
    };
    info!("TCP session {} established with {}:{}", generation, host, port);
    if inbound_tx.send((generation, Inbound::Connected)).is_err() {
        return;
    }

    let (reader, writer) = stream.into_split();
    let mut tasks = JoinSet::new();
    tasks.spawn(read_loop(
        reader,
        config.buffer,
        generation,
        inbound_tx.clone(),
    ));
    tasks.spawn(write_loop(writer, send_rx, generation, inbound_tx));

    // JoinSet 被丢弃时会取消剩下的那个循环
    tasks.join_next().await;
}

/// 接收循环：读入缓冲区，切出完整帧，按顺序交给 tick 线程
async fn read_loop(
    mut reader: OwnedReadHalf,
    limits: BufferLimits,
    generation: u64,
    inbound_tx: InboundTx,
) {
    let lost = |reason, detail: String| {
        let _ = inbound_tx.send((generation, Inbound::Lost { reason, detail }));
    };
    let mut buffer = ReceiveBuffer::new(limits);

    loop {
        let spare = match buffer.writable() {
            Ok(spare) => spare,
            Err(e) => {
                lost(DisconnectReason::ProtocolError, e.to_string());
                return;
            }
        };
        let n = match reader.read(spare).await {
            Ok(0) => {
                debug!("TCP session {} closed by peer", generation);
                lost(DisconnectReason::ServerClosed, "connection closed by peer".to_string());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                lost(DisconnectReason::NetworkError, format!("receive failed: {}", e));
                return;
            }
        };
        buffer.commit(n);

        loop {
            match buffer.next_packet() {
                Ok(Some(packet)) => {
                    if inbound_tx.send((generation, Inbound::Packet(packet))).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    lost(DisconnectReason::ProtocolError, e.to_string());
                    return;
                }
            }
        }
        buffer.settle();
    }
}

/// 发送循环：等待发送队列，逐帧写出
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut send_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    generation: u64,
    inbound_tx: InboundTx,
) {
    while let Some(frame) = send_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            let _ = inbound_tx.send((
                generation,
                Inbound::Lost {
                    reason: DisconnectReason::NetworkError,
                    detail: format!("send failed: {}", e),
                },
            ));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
