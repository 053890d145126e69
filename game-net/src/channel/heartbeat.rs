//! 心跳计时
//!
//! 所有计时都由每帧传入的 dt 推进，不依赖墙钟，宿主暂停时心跳也随之暂停。

use serde::Deserialize;

use crate::constants::{
    HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS, MAX_HEARTBEAT_TIMEOUT_COUNT,
};

/// 心跳配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 发送间隔（秒）
    pub interval: f32,
    /// 接收超时（秒）
    pub timeout: f32,
    /// 连续超时多少次后断开
    pub max_timeouts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: HEARTBEAT_INTERVAL_SECS,
            timeout: HEARTBEAT_TIMEOUT_SECS,
            max_timeouts: MAX_HEARTBEAT_TIMEOUT_COUNT,
        }
    }
}

/// 一次推进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatTick {
    /// 该发心跳了
    pub send: bool,
    /// 连续超时次数达到上限
    pub expired: bool,
}

/// 心跳状态
#[derive(Debug, Clone)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    since_send: f32,
    since_receive: f32,
    timeouts: u32,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            since_send: 0.0,
            since_receive: 0.0,
            timeouts: 0,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// 连接建立时清零
    pub fn reset(&mut self) {
        self.since_send = 0.0;
        self.since_receive = 0.0;
        self.timeouts = 0;
    }

    /// 发出了任意消息
    pub fn on_sent(&mut self) {
        self.since_send = 0.0;
    }

    /// 收到了任意数据
    pub fn on_received(&mut self) {
        self.since_receive = 0.0;
        self.timeouts = 0;
    }

    /// 当前连续超时次数
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// 按 dt 推进计时
    pub fn tick(&mut self, dt: f32) -> HeartbeatTick {
        let mut result = HeartbeatTick::default();
        if !self.config.enabled {
            return result;
        }

        self.since_send += dt;
        if self.since_send >= self.config.interval {
            self.since_send = 0.0;
            result.send = true;
        }

        self.since_receive += dt;
        if self.since_receive >= self.config.timeout {
            self.since_receive = 0.0;
            self.timeouts += 1;
            if self.timeouts >= self.config.max_timeouts.max(1) {
                result.expired = true;
            }
        }
        result
    }
}
