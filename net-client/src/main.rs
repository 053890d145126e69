//! 无界面网络客户端
//!
//! 以固定帧率驱动网络管理器，连接回显服务端的三个端口并持续发送探测消息。
//!
//! 用法: net-client [host] [tcp_port] [ws_port] [udp_port] [seconds]

mod client;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use client::{ClientSettings, GameClient};
use game_net::{run_fixed_rate, ChannelKind, NetworkConfig, NetworkManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORTS: [u16; 3] = [7777, 7778, 7779];
const TICK_RATE: u32 = 30;

fn parse_settings() -> Result<ClientSettings> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| DEFAULT_HOST.to_string());

    let mut ports = HashMap::new();
    let kinds = [ChannelKind::Stream, ChannelKind::Message, ChannelKind::Datagram];
    for (kind, default) in kinds.into_iter().zip(DEFAULT_PORTS) {
        let port = match args.next() {
            Some(arg) => arg
                .parse::<u16>()
                .with_context(|| format!("invalid {} port: {}", kind, arg))?,
            None => default,
        };
        // 端口 0 表示不使用该通道
        if port != 0 {
            ports.insert(kind, port);
        }
    }

    let run_for = match args.next() {
        Some(arg) => Some(Duration::from_secs_f32(
            arg.parse::<f32>()
                .with_context(|| format!("invalid duration: {}", arg))?
                .max(0.0),
        )),
        None => None,
    };

    Ok(ClientSettings {
        host,
        ports,
        probe_interval: Duration::from_secs(1),
        run_for,
    })
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("net_client=debug".parse()?)
                .add_directive("game_net=debug".parse()?),
        )
        .init();

    let settings = parse_settings()?;
    info!("Net Client starting, server {}", settings.host);

    let (mut client, event_tx) = GameClient::new(settings);
    let mut manager = NetworkManager::new(NetworkConfig::default(), event_tx)?;
    client.attach(&mut manager);

    // Ctrl+C 在管理器的运行时上监听
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    manager.runtime().spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    client.connect_all(&mut manager);
    run_fixed_rate(&mut manager, TICK_RATE, |manager| {
        client.on_tick(manager) && !stop.load(Ordering::SeqCst)
    });

    info!("Shutting down");
    manager.shutdown();
    client.poll_events();
    client.report();

    Ok(())
}
