//! 主机侧命令定义模块
//!
//! 提供 `Command` 枚举及其线上文本渲染。所有出站流量都经由这里构建，
//! 上层不直接拼接字符串。

use std::fmt;

/// 主机发往控制器的命令
///
/// `Display` 渲染出确切的线上文本（不含行终结符，`\n` 由传输层追加）。
///
/// # Example
///
/// ```
/// use stepctl_protocol::Command;
///
/// assert_eq!(Command::Step(50).to_string(), "step 50");
/// assert_eq!(Command::GetStepCount.to_string(), "getStepCount");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// 验证探测（握手），期望回复 `[v]1`
    Validate,
    /// 顺时针方向
    Forwards,
    /// 逆时针方向
    Backwards,
    /// 追加步数（幅值，无符号；方向由 `Forwards`/`Backwards` 锁定）
    Step(u32),
    /// 开始步进
    Start,
    /// 停止步进
    Stop,
    /// 设置步进延时
    SetDelay(u32),
    /// 查询当前步数
    GetStepCount,
    /// 查询步进目标
    GetStepTarget,
    /// 查询是否顺时针运行
    IsForward,
    /// 查询是否逆时针运行
    IsBackward,
    /// 查询当前步进延时
    GetDelay,
}

impl Command {
    /// 此命令是否期望一条 `[v]` 数值回复
    ///
    /// 只有五条显式查询命令期望回复并进入待回复队列；
    /// 验证探测与步进命令的回复由控制器状态机隐式消费。
    pub fn expects_value(&self) -> bool {
        matches!(
            self,
            Command::GetStepCount
                | Command::GetStepTarget
                | Command::IsForward
                | Command::IsBackward
                | Command::GetDelay
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Validate => write!(f, "stepper_control"),
            Command::Forwards => write!(f, "forwards"),
            Command::Backwards => write!(f, "backwards"),
            Command::Step(n) => write!(f, "step {n}"),
            Command::Start => write!(f, "start"),
            Command::Stop => write!(f, "stop"),
            Command::SetDelay(d) => write!(f, "delay {d}"),
            Command::GetStepCount => write!(f, "getStepCount"),
            Command::GetStepTarget => write!(f, "getStepTarget"),
            Command::IsForward => write!(f, "isForward"),
            Command::IsBackward => write!(f, "isBackward"),
            Command::GetDelay => write!(f, "getDelay"),
        }
    }
}
