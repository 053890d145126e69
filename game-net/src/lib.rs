//! 游戏客户端网络层
//!
//! 包含:
//! - 消息信封与编解码接口 (NetMessage, ReceivedPacket)
//! - 流式帧编解码与接收缓冲 (ReceiveBuffer)
//! - 通道契约与三种通道 (NetworkChannel: TCP / UDP / WebSocket)
//! - UDP 投递方式与 renet 连接配置 (DeliveryMethod)
//! - 网络管理器与生命周期事件 (NetworkManager, NetworkEvent)

mod codec;
mod config;
mod constants;
mod error;
mod event;
mod manager;
mod message;
mod packet;
mod transport;

pub mod channel;

#[cfg(test)]
mod testing;

pub use channel::datagram::{
    connection_config, protocol_id, reason_from_netcode, DatagramChannel, DeliveryMethod,
};
pub use channel::message::{reason_from_close_code, MessageChannel};
pub use channel::stream::StreamChannel;
pub use channel::{
    ChannelCore, ChannelKind, ChannelState, Dispatch, Endpoint, HeartbeatConfig, NetworkChannel,
    ReconnectConfig,
};
pub use codec::{encode_stream_frame, BufferLimits, ReceiveBuffer};
pub use config::{DatagramConfig, MessageConfig, NetworkConfig, StreamConfig};
pub use constants::*;
pub use error::{NetError, Result};
pub use event::{DisconnectReason, EventBus, EventQueue, NetworkEvent};
pub use manager::{run_fixed_rate, NetworkManager};
pub use message::NetMessage;
pub use packet::{decode_message_frame, encode_message_frame, MessageId, ReceivedPacket};
pub use transport::{connect_tcp, connect_websocket, resolve, WsStream};
