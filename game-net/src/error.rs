//! 错误类型定义

use thiserror::Error;

/// 网络层错误类型
#[derive(Error, Debug)]
pub enum NetError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// WebSocket 错误
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// 帧长度字段非法（负数）
    #[error("Invalid body length: {0}")]
    InvalidBodyLength(i32),

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 帧不完整，连消息 ID 都放不下
    #[error("Truncated frame: {len} bytes (min: {min})")]
    TruncatedFrame { len: usize, min: usize },

    /// netcode 握手层错误
    #[error("Netcode error: {0}")]
    Netcode(#[from] renet_netcode::NetcodeError),

    /// 主机名解析失败
    #[error("Failed to resolve {host}")]
    Resolve { host: String },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 网络层操作结果类型
pub type Result<T> = std::result::Result<T, NetError>;
