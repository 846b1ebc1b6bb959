//! 待回复命令定义模块
//!
//! 每条显式查询命令对应恰好一条设备回复。命令入队后由三条路径之一
//! 恰好消解一次：FIFO 匹配下一条数值回复、超时清扫、或连接拆除时的
//! 批量消解。消解接收端要么是阻塞槽（有界通道），要么是回调。

use crossbeam_channel::Sender;
use std::time::{Duration, Instant};

/// 消解接收端
///
/// 阻塞查询用容量 1 的通道做槽位，调用方 `recv_timeout` 等待；
/// 回调变体在时钟线程上被调用，必须快速且不得阻塞。
pub(crate) enum ResolutionSink {
    /// 阻塞槽：向等待中的调用方投递结果
    Slot(Sender<Option<i64>>),
    /// 回调：在时钟线程上恰好调用一次
    Callback(Box<dyn FnOnce(Option<i64>) + Send>),
}

impl ResolutionSink {
    /// 消耗自身投递结果
    ///
    /// `self` 按值传入，类型系统保证恰好消解一次；槽位对端已放弃
    /// 等待时发送失败被忽略。
    pub(crate) fn resolve(self, value: Option<i64>) {
        match self {
            ResolutionSink::Slot(tx) => {
                let _ = tx.send(value);
            },
            ResolutionSink::Callback(callback) => callback(value),
        }
    }
}

/// 一条已发出、等待恰好一条回复的命令
pub(crate) struct PendingCommand {
    created: Instant,
    sink: ResolutionSink,
}

impl PendingCommand {
    pub(crate) fn new(sink: ResolutionSink) -> Self {
        Self {
            created: Instant::now(),
            sink,
        }
    }

    /// 命令自身的年龄是否超过超时窗口
    ///
    /// 与全局状态迁移时间戳无关，逐条独立判定。
    pub(crate) fn is_expired(&self, timeout: Duration) -> bool {
        self.created.elapsed() >= timeout
    }

    pub(crate) fn resolve(self, value: Option<i64>) {
        self.sink.resolve(value);
    }
}
