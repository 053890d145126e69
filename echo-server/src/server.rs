//! 回显服务器核心实现
//!
//! 同时监听三种传输，把收到的每条消息原样发回：
//! - TCP：流式帧 `[len][id][body]`，心跳帧也回显
//! - WebSocket：每个二进制帧一条消息
//! - UDP：renet + netcode，握手密钥映射为协议号，消息从收到的通道发回

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use game_net::{
    connection_config, decode_message_frame, encode_stream_frame, protocol_id, BufferLimits,
    DeliveryMethod, ReceiveBuffer, MAX_MESSAGE_SIZE,
};
use renet::{RenetServer, ServerEvent};
use renet_netcode::{NetcodeServerTransport, ServerAuthentication, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// 最大并发连接数（TCP + WebSocket）
const MAX_CONNECTIONS: u32 = 256;
/// 最大 UDP 客户端数
const MAX_UDP_CLIENTS: usize = 64;
/// UDP 传输层推进间隔
const UDP_TICK: Duration = Duration::from_millis(10);
/// 可靠消息重发间隔（秒）
const UDP_RESEND_INTERVAL: f32 = 0.3;

/// 三个监听地址
#[derive(Debug, Clone)]
pub struct ServerAddrs {
    pub tcp: String,
    pub websocket: String,
    pub udp: String,
}

/// 共享状态
struct SharedState {
    /// 当前连接数
    connection_count: AtomicU32,
}

impl SharedState {
    fn new() -> Self {
        Self {
            connection_count: AtomicU32::new(0),
        }
    }

    /// 增加连接数，如果超过限制则返回 false
    fn try_add_connection(&self) -> bool {
        loop {
            let current = self.connection_count.load(Ordering::SeqCst);
            if current >= MAX_CONNECTIONS {
                return false;
            }
            if self
                .connection_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn remove_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn online_count(&self) -> u32 {
        self.connection_count.load(Ordering::SeqCst)
    }
}

/// 回显服务器
pub struct EchoServer {
    state: Arc<SharedState>,
    connection_key: String,
    /// 关闭信号发送端
    shutdown_tx: watch::Sender<bool>,
    /// 关闭信号接收端（用于克隆给连接处理器）
    shutdown_rx: watch::Receiver<bool>,
}

impl EchoServer {
    pub fn new(connection_key: impl Into<String>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Arc::new(SharedState::new()),
            connection_key: connection_key.into(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// 运行服务器直到收到 Ctrl+C
    pub async fn run(&self, addrs: &ServerAddrs) -> anyhow::Result<()> {
        let tcp = TcpListener::bind(&addrs.tcp).await?;
        let websocket = TcpListener::bind(&addrs.websocket).await?;
        let udp = UdpSocket::bind(&addrs.udp)?;
        info!("TCP echo listening on {}", tcp.local_addr()?);
        info!("WebSocket echo listening on {}", websocket.local_addr()?);
        info!("UDP echo listening on {}", udp.local_addr()?);

        let udp_task = tokio::spawn(run_udp(
            udp,
            self.connection_key.clone(),
            self.shutdown_rx.clone(),
        ));

        loop {
            tokio::select! {
                result = tcp.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr, false),
                        Err(e) => error!("Failed to accept TCP connection: {}", e),
                    }
                }

                result = websocket.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr, true),
                        Err(e) => error!("Failed to accept WebSocket connection: {}", e),
                    }
                }

                // 监听 Ctrl+C 信号
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
            }
        }

        let _ = udp_task.await;
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, websocket: bool) {
        if !self.state.try_add_connection() {
            warn!("Connection limit reached, rejecting {}", addr);
            return;
        }
        let _ = stream.set_nodelay(true);

        let state = Arc::clone(&self.state);
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let result = if websocket {
                handle_websocket(stream, addr, shutdown_rx).await
            } else {
                handle_stream(stream, addr, shutdown_rx).await
            };
            if let Err(e) = result {
                debug!("Connection {} ended with error: {}", addr, e);
            }
            state.remove_connection();
        });
    }

    /// 执行 graceful shutdown
    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        // 等待所有连接断开（最多等待 5 秒）
        let start = Instant::now();
        let timeout_duration = Duration::from_secs(5);

        while self.state.online_count() > 0 {
            if start.elapsed() > timeout_duration {
                warn!(
                    "Shutdown timeout, {} connections still active",
                    self.state.online_count()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Server shutdown complete");
    }
}

/// TCP 连接：切帧并逐帧回显
async fn handle_stream(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("TCP client {} connected", addr);
    let mut buffer = ReceiveBuffer::new(BufferLimits::default());

    loop {
        let n = tokio::select! {
            result = stream.read(buffer.writable()?) => result?,
            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, closing TCP client {}", addr);
                break;
            }
        };
        if n == 0 {
            info!("TCP client {} disconnected", addr);
            break;
        }
        buffer.commit(n);

        while let Some(packet) = buffer.next_packet()? {
            debug!(
                "TCP {} echo id={} len={}",
                addr,
                packet.message_id,
                packet.body_len()
            );
            stream
                .write_all(&encode_stream_frame(packet.message_id, &packet.body))
                .await?;
        }
        buffer.settle();
    }
    Ok(())
}

/// WebSocket 连接：校验信封后原样回显二进制帧
async fn handle_websocket(
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    info!("WebSocket client {} connected", addr);

    loop {
        tokio::select! {
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        match decode_message_frame(&data, MAX_MESSAGE_SIZE) {
                            Ok(packet) => {
                                debug!(
                                    "WebSocket {} echo id={} len={}",
                                    addr,
                                    packet.message_id,
                                    packet.body_len()
                                );
                                ws.send(Message::Binary(data)).await?;
                            }
                            Err(e) => {
                                warn!("WebSocket {} sent a bad frame: {}", addr, e);
                                let frame = CloseFrame {
                                    code: CloseCode::Protocol,
                                    reason: e.to_string().into(),
                                };
                                let _ = ws.close(Some(frame)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client {} disconnected", addr);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, closing WebSocket client {}", addr);
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = ws.close(Some(frame)).await;
                break;
            }
        }
    }
    Ok(())
}

/// UDP 回显：推进 netcode 传输并把每条消息原样发回
async fn run_udp(
    socket: UdpSocket,
    key: String,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = socket.local_addr()?;
    let mut server = RenetServer::new(connection_config(UDP_RESEND_INTERVAL));
    let config = ServerConfig {
        current_time: SystemTime::now().duration_since(UNIX_EPOCH)?,
        max_clients: MAX_UDP_CLIENTS,
        protocol_id: protocol_id(&key),
        public_addresses: vec![addr],
        authentication: ServerAuthentication::Unsecure,
    };
    let mut transport = NetcodeServerTransport::new(config, socket)?;
    let mut tick = tokio::time::interval(UDP_TICK);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let delta = now - last;
                last = now;
                server.update(delta);
                if let Err(e) = transport.update(delta, &mut server) {
                    debug!("UDP transport error: {}", e);
                }
                log_udp_events(&mut server);
                echo_udp(&mut server);
                transport.send_packets(&mut server);
            }

            _ = shutdown_rx.changed() => {
                let count = server.clients_id().len();
                transport.disconnect_all(&mut server);
                info!("UDP echo stopped, {} clients notified", count);
                break;
            }
        }
    }
    Ok(())
}

fn log_udp_events(server: &mut RenetServer) {
    while let Some(event) = server.get_event() {
        match event {
            ServerEvent::ClientConnected { client_id } => {
                info!("UDP client {} connected", client_id);
            }
            ServerEvent::ClientDisconnected { client_id, reason } => {
                info!("UDP client {} disconnected: {:?}", client_id, reason);
            }
        }
    }
}

/// 把所有客户端的待收消息从原通道发回
fn echo_udp(server: &mut RenetServer) {
    for client_id in server.clients_id() {
        for method in DeliveryMethod::ALL {
            while let Some(message) = server.receive_message(client_id, method) {
                match decode_message_frame(&message, MAX_MESSAGE_SIZE) {
                    Ok(packet) => debug!(
                        "UDP {} echo id={} len={} ({:?})",
                        client_id,
                        packet.message_id,
                        packet.body_len(),
                        method
                    ),
                    Err(e) => {
                        warn!("UDP {} sent a bad message: {}", client_id, e);
                        continue;
                    }
                }
                server.send_message(client_id, method, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_net::{
        ChannelKind, DatagramChannel, DatagramConfig, DisconnectReason, NetMessage,
        NetworkChannel, NetworkEvent, ReconnectConfig,
    };
    use serde::{Deserialize, Serialize};

    const KEY: &str = "echo-test";

    #[derive(Serialize, Deserialize)]
    struct Value(u32);

    impl NetMessage for Value {}

    /// 驱动通道直到条件满足，约 4 秒后放弃
    fn pump(
        channel: &mut DatagramChannel,
        mut done: impl FnMut(&[NetworkEvent]) -> bool,
    ) -> bool {
        let mut events = Vec::new();
        for _ in 0..400 {
            channel.update(0.01, 0.01);
            events.extend(channel.take_events());
            if done(&events) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn start_udp(rt: &tokio::runtime::Runtime, key: &str) -> (u16, watch::Sender<bool>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        rt.spawn(run_udp(socket, key.to_string(), shutdown_rx));
        (port, shutdown_tx)
    }

    fn datagram_channel(rt: &tokio::runtime::Runtime) -> DatagramChannel {
        let config = DatagramConfig {
            connection_key: KEY.to_string(),
            connect_timeout: 1.0,
            reconnect: ReconnectConfig {
                enabled: false,
                ..ReconnectConfig::default()
            },
            ..DatagramConfig::default()
        };
        DatagramChannel::new(config, rt.handle().clone())
    }

    #[test]
    fn test_udp_echo_round_trip() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (port, _shutdown_tx) = start_udp(&rt, KEY);
        let mut channel = datagram_channel(&rt);
        let received = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&received);
        channel.register_handler(5, move |value: Value| {
            counter.store(value.0, Ordering::SeqCst);
        });

        channel.connect("127.0.0.1", port);
        assert!(pump(&mut channel, |events| {
            events
                .iter()
                .any(|e| matches!(e, NetworkEvent::Connected { .. }))
        }));
        assert!(channel.send_with(5, &Value(42), DeliveryMethod::Unreliable));
        assert!(pump(&mut channel, |_| received.load(Ordering::SeqCst) == 42));
    }

    #[test]
    fn test_udp_shutdown_notifies_clients() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (port, shutdown_tx) = start_udp(&rt, KEY);
        let mut channel = datagram_channel(&rt);

        channel.connect("127.0.0.1", port);
        assert!(pump(&mut channel, |events| {
            events
                .iter()
                .any(|e| matches!(e, NetworkEvent::Connected { .. }))
        }));
        shutdown_tx.send(true).unwrap();
        assert!(pump(&mut channel, |events| {
            events.contains(&NetworkEvent::Disconnected {
                channel: ChannelKind::Datagram,
                reason: DisconnectReason::ServerClosed,
            })
        }));
    }

    #[test]
    fn test_udp_wrong_key_never_connects() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (port, _shutdown_tx) = start_udp(&rt, "other-key");
        let mut channel = datagram_channel(&rt);

        channel.connect("127.0.0.1", port);
        assert!(pump(&mut channel, |events| {
            events
                .iter()
                .any(|e| matches!(e, NetworkEvent::ConnectFailed { .. }))
        }));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_stream_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = handle_stream(stream, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(local).await.unwrap();
        let frame = encode_stream_frame(42, b"echo me");
        client.write_all(&frame).await.unwrap();
        let mut reply = vec![0u8; frame.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, frame);
    }
}
