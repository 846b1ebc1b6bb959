//! 协议常量定义

/// 串口波特率（固件固定值，不协商）
pub const BAUD_RATE: u32 = 9600;

/// 固件接受的最小步进延时
pub const MIN_STEP_DELAY: u32 = 2;

/// 验证探测命令的期望回复值
pub const VALIDATION_OK: i64 = 1;

/// 入站行前缀长度（`[m]` / `[v]`）
pub const PREFIX_LEN: usize = 3;
