//! 通道配置
//!
//! 所有结构都有合理的默认值，也可以从配置文件反序列化（缺省字段取默认值）。

use serde::Deserialize;

use crate::channel::{HeartbeatConfig, ReconnectConfig};
use crate::codec::BufferLimits;
use crate::channel::datagram::DeliveryMethod;
use crate::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CONNECTION_KEY, MAX_DATAGRAM_SIZE, MAX_MESSAGE_SIZE,
};

/// 流式通道（TCP）配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 通道名，用于日志
    pub name: String,
    /// 连接超时（秒）
    pub connect_timeout: f32,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
    /// 接收缓冲区与消息大小限制
    pub buffer: BufferLimits,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "tcp".to_string(),
            connect_timeout: CONNECT_TIMEOUT_SECS,
            nodelay: true, // 游戏流量建议开启，减少延迟
            buffer: BufferLimits::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// 数据报通道（UDP）配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    pub name: String,
    /// 握手密钥，映射为 netcode 协议号，两端不一致时握手不会成功
    pub connection_key: String,
    /// 握手超时（秒），按帧时间累计
    pub connect_timeout: f32,
    /// 可靠消息重发间隔（秒）
    pub resend_interval: f32,
    /// 单条消息体最大长度
    pub max_message_size: usize,
    /// `send` 使用的投递方式
    pub default_delivery: DeliveryMethod,
    pub reconnect: ReconnectConfig,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            name: "udp".to_string(),
            connection_key: DEFAULT_CONNECTION_KEY.to_string(),
            connect_timeout: CONNECT_TIMEOUT_SECS,
            resend_interval: 0.3,
            max_message_size: MAX_DATAGRAM_SIZE,
            default_delivery: DeliveryMethod::ReliableOrdered,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// 消息式通道（WebSocket）配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub name: String,
    /// 使用 wss://
    pub use_tls: bool,
    /// URL 路径，例如 "/ws"
    pub path: String,
    /// 握手超时（秒）
    pub connect_timeout: f32,
    /// 单条消息体最大长度
    pub max_message_size: usize,
    /// 心跳使用的业务消息 ID；为空时发送协议层 Ping
    pub heartbeat_message_id: Option<u16>,
    /// 心跳配置，消息式通道只看一次超时
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            name: "websocket".to_string(),
            use_tls: false,
            path: "/".to_string(),
            connect_timeout: CONNECT_TIMEOUT_SECS,
            max_message_size: MAX_MESSAGE_SIZE,
            heartbeat_message_id: None,
            heartbeat: HeartbeatConfig {
                max_timeouts: 1,
                ..HeartbeatConfig::default()
            },
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MessageConfig {
    /// 拼出连接 URL
    pub fn url(&self, host: &str, port: u16) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, host, port, path)
    }
}

/// 三种通道的配置集合
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub stream: StreamConfig,
    pub datagram: DatagramConfig,
    pub message: MessageConfig,
}

/// 秒数转 Duration，负数按 0 处理
pub(crate) fn secs(value: f32) -> std::time::Duration {
    std::time::Duration::from_secs_f32(value.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = NetworkConfig::default();
        assert_eq!(config.stream.heartbeat.interval, 5.0);
        assert_eq!(config.stream.heartbeat.timeout, 15.0);
        assert_eq!(config.stream.heartbeat.max_timeouts, 3);
        assert_eq!(config.stream.reconnect.interval, 3.0);
        assert_eq!(config.stream.reconnect.max_attempts, 5);
        assert_eq!(config.stream.buffer.floor, 8 * 1024);
        assert_eq!(config.stream.buffer.ceiling, 1024 * 1024);
        assert_eq!(config.message.heartbeat.max_timeouts, 1);
        assert_eq!(config.datagram.default_delivery, DeliveryMethod::ReliableOrdered);
    }

    #[test]
    fn test_websocket_url() {
        let mut config = MessageConfig::default();
        assert_eq!(config.url("example.com", 80), "ws://example.com:80/");
        config.use_tls = true;
        config.path = "game".to_string();
        assert_eq!(config.url("example.com", 443), "wss://example.com:443/game");
    }

    #[test]
    fn test_secs_clamps_negative() {
        assert_eq!(secs(-1.0), std::time::Duration::ZERO);
        assert_eq!(secs(1.5), std::time::Duration::from_millis(1500));
    }
}
