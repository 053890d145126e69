//! 开发用回显服务端
//!
//! 用法: echo-server [tcp_addr] [ws_addr] [udp_addr]

mod server;

use anyhow::Result;
use game_net::DEFAULT_CONNECTION_KEY;
use server::{EchoServer, ServerAddrs};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TCP_ADDR: &str = "127.0.0.1:7777";
const DEFAULT_WS_ADDR: &str = "127.0.0.1:7778";
const DEFAULT_UDP_ADDR: &str = "127.0.0.1:7779";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("echo_server=debug".parse()?)
                .add_directive("game_net=debug".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addrs = ServerAddrs {
        tcp: args.next().unwrap_or_else(|| DEFAULT_TCP_ADDR.to_string()),
        websocket: args.next().unwrap_or_else(|| DEFAULT_WS_ADDR.to_string()),
        udp: args.next().unwrap_or_else(|| DEFAULT_UDP_ADDR.to_string()),
    };

    info!("Echo Server starting");

    let server = EchoServer::new(DEFAULT_CONNECTION_KEY);
    server.run(&addrs).await?;

    Ok(())
}
