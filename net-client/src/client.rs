//! 无界面客户端核心实现
//!
//! 把 [`NetworkManager`] 当作宿主游戏循环的网络层来用：
//! 每帧驱动管理器、消费生命周期事件，并定期在每个已连接通道上发送探测消息，
//! 用服务端回显计算往返时间。

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use game_net::{
    ChannelKind, DeliveryMethod, DisconnectReason, NetMessage, NetworkChannel, NetworkEvent,
    NetworkManager,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 探测消息 ID（三个通道通用）
pub const PROBE_ID: u16 = 1001;
/// 位置同步消息 ID（只走 UDP，不可靠投递）
pub const POSITION_ID: u16 = 1002;

/// 管理器的事件总线类型
pub type EventSender = std_mpsc::Sender<NetworkEvent>;

/// 探测消息：服务端原样回显
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Probe {
    pub seq: u32,
    pub sent_at_ms: u64,
}

impl NetMessage for Probe {}

/// 位置同步
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl NetMessage for Position {}

/// 处理器交给客户端的回显
#[derive(Debug)]
enum Echo {
    Probe(ChannelKind, Probe),
    Position(Position),
}

/// 客户端参数
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub ports: HashMap<ChannelKind, u16>,
    /// 探测间隔
    pub probe_interval: Duration,
    /// 运行多久后自动退出，为空时一直运行
    pub run_for: Option<Duration>,
}

/// 单个通道的统计
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub last_rtt_ms: Option<u64>,
    pub disconnects: u64,
}

/// 无界面客户端
pub struct GameClient {
    settings: ClientSettings,
    /// 接收管理器发布的事件
    event_rx: std_mpsc::Receiver<NetworkEvent>,
    echo_tx: std_mpsc::Sender<Echo>,
    echo_rx: std_mpsc::Receiver<Echo>,
    connected: HashSet<ChannelKind>,
    stats: HashMap<ChannelKind, ChannelStats>,
    next_seq: u32,
    started: Instant,
    last_probe: Instant,
    /// 最近一次错误
    pub error_message: Option<String>,
}

impl GameClient {
    /// 创建客户端，返回交给管理器的事件发送端
    pub fn new(settings: ClientSettings) -> (Self, EventSender) {
        let (event_tx, event_rx) = std_mpsc::channel();
        let (echo_tx, echo_rx) = std_mpsc::channel();
        let now = Instant::now();
        let client = Self {
            settings,
            event_rx,
            echo_tx,
            echo_rx,
            connected: HashSet::new(),
            stats: HashMap::new(),
            next_seq: 0,
            started: now,
            last_probe: now,
            error_message: None,
        };
        (client, event_tx)
    }

    /// 在管理器的通道上注册消息处理器
    pub fn attach(&self, manager: &mut NetworkManager<EventSender>) {
        for kind in self.settings.ports.keys().copied() {
            let tx = self.echo_tx.clone();
            let handler = move |probe: Probe| {
                let _ = tx.send(Echo::Probe(kind, probe));
            };
            match kind {
                ChannelKind::Stream => manager.stream_mut().register_handler(PROBE_ID, handler),
                ChannelKind::Datagram => {
                    manager.datagram_mut().register_handler(PROBE_ID, handler)
                }
                ChannelKind::Message => manager.message_mut().register_handler(PROBE_ID, handler),
            }
        }

        let tx = self.echo_tx.clone();
        manager
            .datagram_mut()
            .register_handler(POSITION_ID, move |pos: Position| {
                let _ = tx.send(Echo::Position(pos));
            });
    }

    /// 连接所有配置了端口的通道
    pub fn connect_all(&self, manager: &mut NetworkManager<EventSender>) {
        for (&kind, &port) in &self.settings.ports {
            manager.channel_mut(kind).connect(&self.settings.host, port);
        }
    }

    /// 每帧调用，返回是否继续运行
    pub fn on_tick(&mut self, manager: &mut NetworkManager<EventSender>) -> bool {
        self.poll_events();
        self.poll_echoes();

        if self.last_probe.elapsed() >= self.settings.probe_interval {
            self.last_probe = Instant::now();
            self.send_probes(manager);
        }

        match self.settings.run_for {
            Some(limit) => self.started.elapsed() < limit,
            None => true,
        }
    }

    /// 处理网络事件，返回是否有新事件
    pub fn poll_events(&mut self) -> bool {
        let mut has_events = false;
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
            has_events = true;
        }
        has_events
    }

    fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected {
                channel,
                host,
                port,
            } => {
                info!("{} channel connected to {}:{}", channel, host, port);
                self.connected.insert(channel);
                self.error_message = None;
            }
            NetworkEvent::Disconnected { channel, reason } => {
                self.connected.remove(&channel);
                self.stats.entry(channel).or_default().disconnects += 1;
                if reason == DisconnectReason::Manual {
                    info!("{} channel closed", channel);
                } else {
                    warn!("{} channel lost: {}", channel, reason);
                }
            }
            NetworkEvent::ConnectFailed { channel, error } => {
                warn!("{} channel failed to connect: {}", channel, error);
                self.error_message = Some(error);
            }
            NetworkEvent::Error { channel, message } => {
                warn!("{} channel error: {}", channel, message);
                self.error_message = Some(message);
            }
            NetworkEvent::Reconnecting {
                channel,
                attempt,
                max_attempts,
            } => {
                info!("{} channel reconnecting ({}/{})", channel, attempt, max_attempts);
            }
            NetworkEvent::Reconnected { channel } => {
                info!("{} channel is back", channel);
            }
            NetworkEvent::ReconnectFailed { channel } => {
                warn!("{} channel gave up reconnecting", channel);
                self.error_message = Some(format!("{} reconnect failed", channel));
            }
        }
    }

    fn poll_echoes(&mut self) {
        while let Ok(echo) = self.echo_rx.try_recv() {
            match echo {
                Echo::Probe(kind, probe) => {
                    let rtt = now_ms().saturating_sub(probe.sent_at_ms);
                    let stats = self.stats.entry(kind).or_default();
                    stats.received += 1;
                    stats.last_rtt_ms = Some(rtt);
                    debug!("{} probe #{} rtt={}ms", kind, probe.seq, rtt);
                }
                Echo::Position(pos) => {
                    debug!("position echo ({:.1}, {:.1})", pos.x, pos.y);
                }
            }
        }
    }

    /// 在每个已连接通道上发送探测消息，UDP 另发一条不可靠的位置同步
    fn send_probes(&mut self, manager: &mut NetworkManager<EventSender>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let probe = Probe {
            seq,
            sent_at_ms: now_ms(),
        };

        for &kind in &self.connected {
            let sent = match kind {
                ChannelKind::Stream => manager.stream_mut().send(PROBE_ID, &probe),
                ChannelKind::Datagram => manager.datagram_mut().send(PROBE_ID, &probe),
                ChannelKind::Message => manager.message_mut().send(PROBE_ID, &probe),
            };
            if sent {
                self.stats.entry(kind).or_default().sent += 1;
            }
        }

        if self.connected.contains(&ChannelKind::Datagram) {
            let t = seq as f32 * 0.1;
            let pos = Position {
                x: t.cos() * 10.0,
                y: t.sin() * 10.0,
            };
            manager
                .datagram_mut()
                .send_with(POSITION_ID, &pos, DeliveryMethod::Unreliable);
        }
    }

    pub fn is_connected(&self, kind: ChannelKind) -> bool {
        self.connected.contains(&kind)
    }

    pub fn stats(&self, kind: ChannelKind) -> ChannelStats {
        self.stats.get(&kind).cloned().unwrap_or_default()
    }

    /// 输出各通道统计
    pub fn report(&self) {
        for kind in [ChannelKind::Stream, ChannelKind::Datagram, ChannelKind::Message] {
            if !self.settings.ports.contains_key(&kind) {
                continue;
            }
            let stats = self.stats(kind);
            info!(
                "{}: sent={} received={} last_rtt={:?}ms disconnects={}",
                kind, stats.sent, stats.received, stats.last_rtt_ms, stats.disconnects
            );
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
