//! 控制器构建器模块

use crate::controller::{ControllerConfig, MessageSink, MotorController};
use std::sync::Arc;
use std::time::Duration;
use stepctl_serial::TransportConfig;
use tracing::info;

/// [`MotorController`] 构建器
///
/// # Example
///
/// ```no_run
/// use stepctl_driver::MotorControllerBuilder;
/// use std::time::Duration;
///
/// let controller = MotorControllerBuilder::new("/dev/ttyUSB0")
///     .timeout(Duration::from_secs(3))
///     .debug(true)
///     .message_sink(|msg| println!("{msg}"))
///     .build();
/// ```
pub struct MotorControllerBuilder {
    port: String,
    config: ControllerConfig,
    sink: Option<MessageSink>,
}

impl MotorControllerBuilder {
    /// 创建构建器，`port` 为串口设备名（如 `/dev/ttyUSB0`、`COM3`）
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            config: ControllerConfig::default(),
            sink: None,
        }
    }

    /// 回复超时窗口，默认 5s
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// 打开端口后的安置延时，默认 1s
    pub fn settle_delay(mut self, settle_delay: Duration) -> Self {
        self.config.settle_delay = settle_delay;
        self
    }

    /// 时钟线程的循环间隔，默认 100ms
    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    /// 传输层配置
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// 调试模式：所有收发流量回显到消息回调，默认关闭
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// 整套配置覆盖
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// 设备文本和控制器通知的接收回调
    ///
    /// 未设置时消息经 `tracing` 以 info 级别记录。
    pub fn message_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// 构建控制器（不建立连接，需调用方再 `start_connection`）
    pub fn build(self) -> MotorController {
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(|msg: &str| info!(target: "stepctl::motor", "{msg}")));
        MotorController::new(self.port, self.config, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let controller = MotorControllerBuilder::new("/dev/ttyUSB0").build();
        assert_eq!(controller.port(), "/dev/ttyUSB0");
        assert!(!controller.is_valid());
        assert!(!controller.is_stepping());
    }

    #[test]
    fn test_builder_overrides() {
        let controller = MotorControllerBuilder::new("COM3")
            .timeout(Duration::from_millis(200))
            .settle_delay(Duration::from_millis(10))
            .tick(Duration::from_millis(5))
            .debug(true)
            .build();
        assert_eq!(controller.port(), "COM3");
    }
}
