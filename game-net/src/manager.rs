//! 网络管理器
//!
//! 持有三种通道各一个实例和它们共用的 tokio 运行时，
//! 每帧依次驱动各通道，并把通道产生的生命周期事件发布到事件总线。
//! 事件只从这里发出。

use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::channel::datagram::DatagramChannel;
use crate::channel::message::MessageChannel;
use crate::channel::stream::StreamChannel;
use crate::channel::{ChannelKind, NetworkChannel};
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::event::{EventBus, EventQueue};

/// 网络管理器
///
/// 必须在普通线程上创建和销毁（不能在异步上下文中 drop，运行时会随之关闭）。
pub struct NetworkManager<B: EventBus = EventQueue> {
    // 字段按声明顺序析构：通道先于运行时
    stream: StreamChannel,
    datagram: DatagramChannel,
    message: MessageChannel,
    bus: B,
    runtime: Runtime,
}

impl<B: EventBus> NetworkManager<B> {
    pub fn new(config: NetworkConfig, bus: B) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("game-net-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        info!("Network manager started");

        Ok(Self {
            stream: StreamChannel::new(config.stream, handle.clone()),
            datagram: DatagramChannel::new(config.datagram, handle.clone()),
            message: MessageChannel::new(config.message, handle),
            bus,
            runtime,
        })
    }

    /// 每帧调用一次：驱动所有通道并发布事件
    pub fn update(&mut self, dt: f32, real_dt: f32) {
        tick_channel(&mut self.stream, &mut self.bus, dt, real_dt);
        tick_channel(&mut self.datagram, &mut self.bus, dt, real_dt);
        tick_channel(&mut self.message, &mut self.bus, dt, real_dt);
    }

    /// 以主动断开的方式关闭所有通道，不会触发重连
    pub fn shutdown(&mut self) {
        let channels: [&mut dyn NetworkChannel; 3] =
            [&mut self.stream, &mut self.datagram, &mut self.message];
        for channel in channels {
            channel.disconnect();
            publish_events(channel, &mut self.bus);
        }
    }

    pub fn stream(&self) -> &StreamChannel {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut StreamChannel {
        &mut self.stream
    }

    pub fn datagram(&self) -> &DatagramChannel {
        &self.datagram
    }

    pub fn datagram_mut(&mut self) -> &mut DatagramChannel {
        &mut self.datagram
    }

    pub fn message(&self) -> &MessageChannel {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut MessageChannel {
        &mut self.message
    }

    /// 按类型取通道
    pub fn channel_mut(&mut self, kind: ChannelKind) -> &mut dyn NetworkChannel {
        match kind {
            ChannelKind::Stream => &mut self.stream,
            ChannelKind::Datagram => &mut self.datagram,
            ChannelKind::Message => &mut self.message,
        }
    }

    pub fn is_any_connected(&self) -> bool {
        self.stream.is_connected() || self.datagram.is_connected() || self.message.is_connected()
    }

    /// 运行时句柄，可用来在同一运行时上执行宿主自己的异步任务
    pub fn runtime(&self) -> &Handle {
        self.runtime.handle()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B: EventBus> Drop for NetworkManager<B> {
    fn drop(&mut self) {
        self.shutdown();
        debug!("Network manager stopped");
    }
}

fn tick_channel<B: EventBus>(
    channel: &mut dyn NetworkChannel,
    bus: &mut B,
    dt: f32,
    real_dt: f32,
) {
    channel.update(dt, real_dt);
    publish_events(channel, bus);
}

fn publish_events<B: EventBus>(channel: &mut dyn NetworkChannel, bus: &mut B) {
    for event in channel.take_events() {
        debug!("[{}] event: {:?}", channel.name(), event);
        bus.publish(event);
    }
}

/// 以固定帧率驱动管理器，直到 `keep_running` 返回 false
///
/// 供没有自己主循环的宿主（命令行工具、测试）使用。
pub fn run_fixed_rate<B, F>(manager: &mut NetworkManager<B>, tick_rate: u32, mut keep_running: F)
where
    B: EventBus,
    F: FnMut(&mut NetworkManager<B>) -> bool,
{
    let frame = Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32);
    let mut last = std::time::Instant::now();
    while keep_running(manager) {
        let now = std::time::Instant::now();
        let dt = now.duration_since(last).as_secs_f32();
        last = now;
        manager.update(dt, dt);
        if let Some(rest) = frame.checked_sub(now.elapsed()) {
            thread::sleep(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::event::{DisconnectReason, NetworkEvent};
    use std::sync::mpsc as std_mpsc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.stream.reconnect.enabled = false;
        config
    }

    /// 驱动管理器直到总线里出现满足条件的事件
    fn pump(
        manager: &mut NetworkManager,
        seen: &mut Vec<NetworkEvent>,
        done: impl Fn(&NetworkEvent) -> bool,
    ) -> bool {
        for _ in 0..800 {
            manager.update(0.0, 0.0);
            seen.extend(manager.bus_mut().drain());
            if seen.iter().any(&done) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn listen(manager: &NetworkManager) -> u16 {
        let listener = manager
            .runtime()
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        manager.runtime().spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });
        port
    }

    #[test]
    fn test_events_published_to_bus() {
        let mut manager = NetworkManager::new(config(), EventQueue::new()).unwrap();
        let port = listen(&manager);
        assert!(!manager.is_any_connected());

        manager.stream_mut().connect("127.0.0.1", port);
        let mut seen = Vec::new();
        assert!(pump(&mut manager, &mut seen, |e| matches!(
            e,
            NetworkEvent::Connected {
                channel: ChannelKind::Stream,
                ..
            }
        )));
        assert!(manager.is_any_connected());
        assert!(manager.stream().is_connected());
        assert_eq!(manager.datagram().state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_shutdown_disconnects_manually() {
        let mut manager = NetworkManager::new(config(), EventQueue::new()).unwrap();
        let port = listen(&manager);
        manager.stream_mut().connect("127.0.0.1", port);
        let mut seen = Vec::new();
        assert!(pump(&mut manager, &mut seen, |e| matches!(
            e,
            NetworkEvent::Connected { .. }
        )));

        manager.shutdown();
        assert_eq!(
            manager.bus_mut().drain(),
            vec![NetworkEvent::Disconnected {
                channel: ChannelKind::Stream,
                reason: DisconnectReason::Manual,
            }]
        );
        assert!(!manager.is_any_connected());

        // 再次关闭不产生事件
        manager.shutdown();
        assert!(manager.bus().is_empty());
    }

    #[test]
    fn test_channel_by_kind() {
        let mut manager = NetworkManager::new(NetworkConfig::default(), EventQueue::new()).unwrap();
        for kind in [ChannelKind::Stream, ChannelKind::Datagram, ChannelKind::Message] {
            assert_eq!(manager.channel_mut(kind).kind(), kind);
        }
        assert_eq!(manager.channel_mut(ChannelKind::Datagram).name(), "udp");
    }

    #[test]
    fn test_std_channel_bus() {
        let (tx, rx) = std_mpsc::channel::<NetworkEvent>();
        let mut manager = NetworkManager::new(config(), tx).unwrap();
        let listener = manager
            .runtime()
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        manager.channel_mut(ChannelKind::Stream).connect("127.0.0.1", port);
        let mut failed = false;
        for _ in 0..800 {
            manager.update(0.0, 0.0);
            if let Ok(event) = rx.try_recv() {
                failed = matches!(event, NetworkEvent::ConnectFailed { .. });
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(failed);
    }

    #[test]
    fn test_run_fixed_rate_stops() {
        let mut manager = NetworkManager::new(NetworkConfig::default(), EventQueue::new()).unwrap();
        let mut ticks = 0;
        run_fixed_rate(&mut manager, 200, |_| {
            ticks += 1;
            ticks <= 5
        });
        assert_eq!(ticks, 6);
    }
}
