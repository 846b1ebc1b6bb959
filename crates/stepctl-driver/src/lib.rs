//! 驱动层模块
//!
//! 本模块提供串口步进电机的会话管理功能，包括：
//! - 连接生命周期（验证握手、安置延时、拆除）
//! - 后台时钟线程（事件路由、状态机推进、超时清扫）
//! - 查询命令的 FIFO 回复关联（阻塞 / 回调两种形式）
//! - 带方向锁的步进命令
//!
//! # 使用场景
//!
//! 典型用法是通过 [`MotorControllerBuilder`] 构建控制器，
//! `start_connection` 建连后调用运动 / 查询 API。

mod builder;
mod controller;
mod error;
mod pending;
pub mod state;

pub use builder::MotorControllerBuilder;
pub use controller::{ControllerConfig, MessageSink, MotorController};
pub use error::DriverError;
pub use state::MotorState;

// 上层无需直接依赖底层 crate 即可枚举端口、配置传输层
pub use stepctl_protocol::Command;
pub use stepctl_serial::{TransportConfig, list_ports};
