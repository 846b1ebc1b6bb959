//! 驱动层错误类型定义

use stepctl_serial::SerialError;
use thiserror::Error;

/// 驱动层错误类型
///
/// 只有连接建立路径返回 `Result`；查询 API 永远不抛错，
/// 以 `None` 哨兵表示无法兑现（超时 / 断连 / 会话无效）。
#[derive(Error, Debug)]
pub enum DriverError {
    /// 串口传输错误（端口打开失败、IO 故障）
    #[error("Serial transport error: {0}")]
    Serial(#[from] SerialError),
}
