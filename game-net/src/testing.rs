//! 测试辅助：运行时、逐帧驱动与 UDP 回显服务

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use renet::{RenetServer, ServerEvent};
use renet_netcode::{NetcodeServerTransport, ServerAuthentication, ServerConfig};
use tokio::runtime::Runtime;

use crate::channel::datagram::{connection_config, protocol_id, DeliveryMethod};
use crate::channel::NetworkChannel;
use crate::event::NetworkEvent;

/// 测试用多线程运行时
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// 以固定 dt 逐帧驱动通道，直到条件满足或超过约 4 秒真实时间
pub fn pump_until<C, F>(
    channel: &mut C,
    dt: f32,
    events: &mut Vec<NetworkEvent>,
    mut done: F,
) -> bool
where
    C: NetworkChannel,
    F: FnMut(&C, &[NetworkEvent]) -> bool,
{
    for _ in 0..800 {
        channel.update(dt, dt);
        events.extend(channel.take_events());
        if done(channel, events) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// 统计满足条件的事件个数
pub fn count(events: &[NetworkEvent], pred: impl Fn(&NetworkEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

enum EchoCommand {
    Broadcast(DeliveryMethod, Vec<u8>),
    Stop,
}

/// 讲 netcode 协议的 UDP 回显服务，每条消息从收到的通道原样发回
pub struct UdpEcho {
    addr: SocketAddr,
    commands: std_mpsc::Sender<EchoCommand>,
    disconnects: Arc<AtomicUsize>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UdpEcho {
    pub fn spawn(connection_key: &str) -> Self {
        Self::spawn_on(0, connection_key)
    }

    /// 在指定端口上启动，0 表示随机端口
    pub fn spawn_on(port: u16, connection_key: &str) -> Self {
        let socket = UdpSocket::bind(("127.0.0.1", port)).unwrap();
        let addr = socket.local_addr().unwrap();
        let protocol_id = protocol_id(connection_key);
        let (commands, rx) = std_mpsc::channel();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);

        let thread = thread::spawn(move || {
            let mut server = RenetServer::new(connection_config(0.1));
            let config = ServerConfig {
                current_time: SystemTime::now().duration_since(UNIX_EPOCH).unwrap(),
                max_clients: 8,
                protocol_id,
                public_addresses: vec![addr],
                authentication: ServerAuthentication::Unsecure,
            };
            let mut transport = NetcodeServerTransport::new(config, socket).unwrap();
            let mut last = Instant::now();
            loop {
                let now = Instant::now();
                let delta = now - last;
                last = now;
                server.update(delta);
                let _ = transport.update(delta, &mut server);

                while let Some(event) = server.get_event() {
                    if let ServerEvent::ClientDisconnected { .. } = event {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
                for client_id in server.clients_id() {
                    for method in DeliveryMethod::ALL {
                        while let Some(message) = server.receive_message(client_id, method) {
                            server.send_message(client_id, method, message);
                        }
                    }
                }

                match rx.try_recv() {
                    Ok(EchoCommand::Broadcast(method, payload)) => {
                        server.broadcast_message(method, payload)
                    }
                    Ok(EchoCommand::Stop) | Err(std_mpsc::TryRecvError::Disconnected) => {
                        transport.disconnect_all(&mut server);
                        return;
                    }
                    Err(std_mpsc::TryRecvError::Empty) => {}
                }
                transport.send_packets(&mut server);
                thread::sleep(Duration::from_millis(2));
            }
        });

        Self {
            addr,
            commands,
            disconnects,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// 向所有客户端发送一条原始消息（不经过信封编码）
    pub fn broadcast(&self, method: DeliveryMethod, payload: Vec<u8>) {
        let _ = self.commands.send(EchoCommand::Broadcast(method, payload));
    }

    /// 已断开的客户端数
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// 断开所有客户端并停止
    pub fn stop(&mut self) {
        let _ = self.commands.send(EchoCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UdpEcho {
    fn drop(&mut self) {
        self.stop();
    }
}
