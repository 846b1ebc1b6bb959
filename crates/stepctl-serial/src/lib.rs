//! # Stepctl Serial Adapter Layer
//!
//! 串口硬件抽象层，提供统一的行读写接口抽象。
//!
//! 物理后端是 `serialport` crate（见 `port` 模块）；`mock` feature
//! 提供无硬件的通道后端，供传输层与驱动层测试注入。
//! `transport` 模块在读写接口之上运行独立的接收 / 发送线程。

use thiserror::Error;

pub mod port;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use port::{PortLink, list_ports};
pub use transport::{SerialTransport, TransportConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockHandle, MockLink};

// 重新导出 stepctl-protocol 中的入站事件类型
pub use stepctl_protocol::InboundEvent;

/// 串口适配层统一错误类型
#[derive(Error, Debug)]
pub enum SerialError {
    /// 物理端口打开失败
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial Error: {0}")]
    Serial(#[from] serialport::Error),

    /// 连接中断（对端消失 / 设备拔出）
    #[error("Port disconnected")]
    Disconnected,
}

/// 行读取端（接收线程独占）
///
/// `Ok(None)` 表示一次空读（读超时或暂无完整行），不是错误；
/// `Err` 表示不可恢复的 IO 故障，接收线程据此停机。
pub trait LineReader: Send {
    fn read_line(&mut self) -> Result<Option<String>, SerialError>;
}

/// 行写入端（发送线程独占）
///
/// 实现负责追加行终结符并刷出。
pub trait LineWriter: Send {
    fn write_line(&mut self, line: &str) -> Result<(), SerialError>;
}

/// 可分离的串口连接
///
/// 打开后分离为独立的读写两半，分别移入接收线程和发送线程，
/// 两个方向互不阻塞。
pub trait SerialLink {
    type Reader: LineReader + 'static;
    type Writer: LineWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}
