//! 底层连接建立
//!
//! 只负责带超时地把 socket / WebSocket 建起来，成帧和会话管理在各通道中完成。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{NetError, Result};

/// 客户端 WebSocket 流
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 带超时地建立 TCP 连接
///
/// # Arguments
/// * `host` - 主机名或 IP
/// * `port` - 端口
/// * `connect_timeout` - 解析 + 连接的总超时
/// * `nodelay` - 是否禁用 Nagle 算法
pub async fn connect_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| NetError::ConnectionTimeout)?
        .map_err(NetError::Io)?;

    stream.set_nodelay(nodelay)?;
    Ok(stream)
}

/// 带超时地完成 WebSocket 握手
pub async fn connect_websocket(url: &str, connect_timeout: Duration) -> Result<WsStream> {
    let (stream, _response) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| NetError::ConnectionTimeout)??;
    Ok(stream)
}

/// 解析主机名，取第一个地址
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| NetError::Resolve {
            host: host.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect_tcp("127.0.0.1", addr.port(), Duration::from_secs(2), true)
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_tcp("127.0.0.1", port, Duration::from_secs(2), true).await;
        assert!(matches!(result, Err(NetError::Io(_))));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 7777).await.unwrap();
        assert_eq!(addr.port(), 7777);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_websocket_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.is_ok()
        });

        let url = format!("ws://{}/", addr);
        assert!(connect_websocket(&url, Duration::from_secs(2)).await.is_ok());
        assert!(server.await.unwrap());
    }
}
