//! 网络层默认参数
//!
//! 这些数值是产品调优后的默认值，并非协议要求，均可通过配置覆盖。

/// 流式通道帧头大小: 4 字节长度 + 2 字节消息 ID
pub const STREAM_HEADER_SIZE: usize = 6;

/// 消息式帧头大小（UDP / WebSocket）: 2 字节消息 ID
pub const MESSAGE_HEADER_SIZE: usize = 2;

/// 心跳保留的消息 ID
pub const HEARTBEAT_MESSAGE_ID: u16 = 0;

/// 接收缓冲区初始大小（下限）
pub const RECEIVE_BUFFER_FLOOR: usize = 8 * 1024;

/// 接收缓冲区上限
pub const RECEIVE_BUFFER_CEILING: usize = 1024 * 1024;

/// 单条消息体最大长度
pub const MAX_MESSAGE_SIZE: usize = RECEIVE_BUFFER_CEILING - STREAM_HEADER_SIZE;

/// 缓冲区使用率低于此比例时尝试收缩
pub const BUFFER_SHRINK_USAGE: f32 = 0.25;

/// 缓冲区容量达到下限的此倍数时才允许收缩
pub const BUFFER_SHRINK_MULTIPLE: usize = 4;

/// 心跳发送间隔（秒）
pub const HEARTBEAT_INTERVAL_SECS: f32 = 5.0;

/// 心跳超时（秒）- 超过此时间无任何入站数据记一次超时
pub const HEARTBEAT_TIMEOUT_SECS: f32 = 15.0;

/// 连续超时次数上限，达到后强制断开
pub const MAX_HEARTBEAT_TIMEOUT_COUNT: u32 = 3;

/// 重连等待间隔（秒）
pub const RECONNECT_INTERVAL_SECS: f32 = 3.0;

/// 最大重连次数
pub const MAX_RECONNECT_COUNT: u32 = 5;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: f32 = 5.0;

/// UDP 握手密钥默认值
pub const DEFAULT_CONNECTION_KEY: &str = "game-net";

/// UDP 单条消息体默认上限
pub const MAX_DATAGRAM_SIZE: usize = 1200;
