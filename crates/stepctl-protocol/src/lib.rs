//! # Stepctl Protocol
//!
//! 步进电机控制器的行协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `command`: 主机侧命令及其线上文本
//! - `event`: 入站行分类（消息 / 数值 / 非法数值）
//! - `constants`: 协议常量定义
//!
//! ## 帧格式
//!
//! 协议是面向行的文本协议，一行一条消息，`\n` 结尾。
//! 入站行以 3 字符前缀区分：`[m]` 为自由文本，`[v]` 为整数回复。

pub mod command;
pub mod constants;
pub mod event;

// 重新导出常用类型
pub use command::Command;
pub use constants::*;
pub use event::{InboundEvent, parse_line};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// `[v]` 行的剩余部分不是合法整数
    #[error("Invalid value payload: {raw:?}")]
    InvalidValue { raw: String },
}
