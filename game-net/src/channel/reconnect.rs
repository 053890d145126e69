//! 断线重连退避策略
//!
//! 三种通道共用同一套规则：非主动断开后等待固定间隔再重试，
//! 次数有上限；耗尽后停止自动重连，直到下一次显式 connect。

use serde::Deserialize;

use crate::constants::{MAX_RECONNECT_COUNT, RECONNECT_INTERVAL_SECS};
use crate::event::DisconnectReason;

/// 重连配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 是否自动重连
    pub enabled: bool,
    /// 每次重试前的等待时间（秒）
    pub interval: f32,
    /// 最大重试次数
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: RECONNECT_INTERVAL_SECS,
            max_attempts: MAX_RECONNECT_COUNT,
        }
    }
}

/// 一次重试失败后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// 继续等待下一次重试
    Retry,
    /// 次数耗尽
    Exhausted,
}

/// 重连状态
#[derive(Debug, Clone)]
pub struct Reconnector {
    config: ReconnectConfig,
    attempt: u32,
    elapsed: f32,
    waiting: bool,
    manual: bool,
    exhausted: bool,
}

impl Reconnector {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            elapsed: 0.0,
            waiting: false,
            manual: false,
            exhausted: false,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// 当前重试次数，0 表示不在重连流程中
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// 是否处于重连流程（等待中或正在尝试）
    pub fn is_reconnecting(&self) -> bool {
        self.waiting || self.attempt > 0
    }

    /// 是否正在等待下一次重试
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// 显式 connect：清空所有状态
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.elapsed = 0.0;
        self.waiting = false;
        self.manual = false;
        self.exhausted = false;
    }

    /// 主动断开：取消所有后续重试
    pub fn cancel(&mut self) {
        self.manual = true;
        self.waiting = false;
        self.attempt = 0;
        self.elapsed = 0.0;
    }

    /// 连接丢失，返回是否进入重连等待
    pub fn schedule(&mut self, reason: DisconnectReason) -> bool {
        if !self.config.enabled
            || self.manual
            || self.exhausted
            || !reason.allows_reconnect()
            || self.config.max_attempts == 0
        {
            return false;
        }
        self.waiting = true;
        self.elapsed = 0.0;
        true
    }

    /// 按 dt 推进等待，到点时返回本次重试序号
    pub fn tick(&mut self, dt: f32) -> Option<u32> {
        if !self.waiting {
            return None;
        }
        self.elapsed += dt;
        if self.elapsed < self.config.interval {
            return None;
        }
        self.waiting = false;
        self.elapsed = 0.0;
        self.attempt += 1;
        Some(self.attempt)
    }

    /// 连接成功，返回这是否是一次重连
    pub fn on_connected(&mut self) -> bool {
        let reconnected = self.attempt > 0;
        self.attempt = 0;
        self.elapsed = 0.0;
        self.waiting = false;
        reconnected
    }

    /// 一次重试失败
    pub fn on_attempt_failed(&mut self) -> RetryOutcome {
        if self.attempt >= self.config.max_attempts {
            self.exhausted = true;
            self.waiting = false;
            self.attempt = 0;
            RetryOutcome::Exhausted
        } else {
            self.waiting = true;
            self.elapsed = 0.0;
            RetryOutcome::Retry
        }
    }
}
