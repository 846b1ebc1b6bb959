//! 入站行分类模块
//!
//! 接收线程逐行读取串口数据，经 `parse_line` 转换为带标签的
//! `InboundEvent`，再由控制器的时钟线程消费。事件是瞬态的，
//! 不会跨 tick 持久化。

use crate::ProtocolError;
use crate::constants::PREFIX_LEN;

/// 传输层产出的入站事件
///
/// 三种变体对应三类入站行；没有合法前缀的行在 `parse_line`
/// 中被静默丢弃，不产生事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `[m]` 行：人类可读文本，原样透传给消息回调（仅去尾部空白）
    Message(String),
    /// `[v]` 行：整数回复
    Value(i64),
    /// `[v]` 行但整数解析失败，携带原始剩余文本
    InvalidValue(String),
}

/// 解析 `[v]` 行的数值载荷
fn parse_value(raw: &str) -> Result<i64, ProtocolError> {
    raw.trim().parse::<i64>().map_err(|_| ProtocolError::InvalidValue {
        raw: raw.to_string(),
    })
}

/// 将一行入站文本分类为事件
///
/// - `[m]` 前缀：`Message`，剩余部分去尾部空白
/// - `[v]` 前缀：整数解析成功为 `Value`，失败为 `InvalidValue`
/// - 其他前缀或不足 3 字符的行：`None`（静默丢弃）
///
/// # Example
///
/// ```
/// use stepctl_protocol::{InboundEvent, parse_line};
///
/// assert_eq!(parse_line("[v]42"), Some(InboundEvent::Value(42)));
/// assert_eq!(
///     parse_line("[m]hello \r\n"),
///     Some(InboundEvent::Message("hello".to_string()))
/// );
/// assert_eq!(parse_line("noise"), None);
/// ```
pub fn parse_line(line: &str) -> Option<InboundEvent> {
    if line.len() < PREFIX_LEN {
        return None;
    }
    if let Some(rest) = line.strip_prefix("[m]") {
        Some(InboundEvent::Message(rest.trim_end().to_string()))
    } else if let Some(rest) = line.strip_prefix("[v]") {
        match parse_value(rest) {
            Ok(value) => Some(InboundEvent::Value(value)),
            Err(_) => Some(InboundEvent::InvalidValue(rest.trim_end().to_string())),
        }
    } else {
        None
    }
}
