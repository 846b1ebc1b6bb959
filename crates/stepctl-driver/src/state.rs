//! 控制器会话状态定义

/// 电机控制器的会话状态
///
/// 整个控制器只有一个状态实例。命令 API 只能让状态"向前"推进
/// （`Standby → AwaitStepping` 以及步进中的同向追加）；其余迁移
/// 全部由时钟线程响应设备回复或超时来完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    /// 无有效连接（初始态、超时或断连后）
    Invalid,
    /// 验证探测已发出，等待 `[v]1` 回复
    Validating,
    /// 连接有效，电机空闲
    Standby,
    /// 步进命令已发出，等待设备回报步进目标
    AwaitStepping,
    /// 电机正在步进，等待完成回报
    Stepping,
}

impl MotorState {
    /// 连接有效（已通过验证，可以接受命令）
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            MotorState::Standby | MotorState::AwaitStepping | MotorState::Stepping
        )
    }

    /// 正在验证（尚未有效，但可能很快有效）
    pub fn is_validating(&self) -> bool {
        matches!(self, MotorState::Validating)
    }

    /// 有效或正在验证
    pub fn is_valid_or_validating(&self) -> bool {
        self.is_valid() || self.is_validating()
    }

    /// 正在步进（含等待步进目标回报的阶段）
    pub fn is_stepping(&self) -> bool {
        matches!(self, MotorState::AwaitStepping | MotorState::Stepping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!MotorState::Invalid.is_valid_or_validating());
        assert!(MotorState::Validating.is_valid_or_validating());
        assert!(!MotorState::Validating.is_valid());
        assert!(MotorState::Standby.is_valid());
        assert!(!MotorState::Standby.is_stepping());
        assert!(MotorState::AwaitStepping.is_stepping());
        assert!(MotorState::Stepping.is_stepping());
        assert!(MotorState::Stepping.is_valid());
    }
}
