//! 串口传输层模块
//!
//! 在行读写接口之上运行两个后台线程：接收线程把入站行分类为
//! [`InboundEvent`] 并缓存，发送线程按 FIFO 顺序排空出站命令队列。
//! 拥有者（控制器时钟线程）通过 [`SerialTransport::poll_inbound`]
//! 原子地取走缓存的事件。

use crate::{LineReader, LineWriter, SerialError, SerialLink, port::PortLink};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use stepctl_protocol::{InboundEvent, parse_line};
use tracing::{error, trace};

/// 传输层配置
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stepctl_serial::TransportConfig;
///
/// // 默认配置（50ms 循环间隔）
/// let config = TransportConfig::default();
///
/// // 测试中用更短的间隔
/// let config = TransportConfig {
///     pace: Duration::from_millis(2),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// 接收 / 发送循环的间隔，必须远小于控制器的超时窗口
    pub pace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(50),
        }
    }
}

/// 接收线程与拥有者共享的状态
struct TransportShared {
    /// 运行标志（Acquire/Release：观察到 false 时，之前的清理写入必须可见）
    running: AtomicBool,
    /// 入站事件缓冲，`poll_inbound` 原子排空
    inbound: Mutex<Vec<InboundEvent>>,
}

impl TransportShared {
    /// 报告一次致命 IO 故障并停机
    ///
    /// 故障文本作为 `Message` 事件进入缓冲，由拥有者透传给消息回调；
    /// 只报告一次，随后循环退出。
    fn fail(&self, notice: String) {
        error!("{}", notice);
        self.inbound.lock().push(InboundEvent::Message(notice));
        self.running.store(false, Ordering::Release);
    }
}

/// 串口传输
///
/// 拥有物理连接和两个后台线程。所有方法都是 `&self`：
/// 出站队列是通道，入站缓冲有锁，运行标志是原子量。
pub struct SerialTransport {
    shared: Arc<TransportShared>,
    outbound_tx: Sender<String>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialTransport {
    /// 打开物理端口并启动传输
    ///
    /// 打开失败时不启动任何线程，直接返回 [`SerialError`]。
    pub fn connect(port: &str, config: TransportConfig) -> Result<Self, SerialError> {
        let link = PortLink::open(port)?;
        Ok(Self::start(link, config))
    }

    /// 在已建立的连接上启动接收 / 发送线程
    ///
    /// 测试通过 mock 链路从这里进入，跳过物理端口。
    pub fn start<L>(link: L, config: TransportConfig) -> Self
    where
        L: SerialLink,
    {
        let (reader, writer) = link.split();
        let (outbound_tx, outbound_rx) = unbounded();

        let shared = Arc::new(TransportShared {
            running: AtomicBool::new(true),
            inbound: Mutex::new(Vec::new()),
        });

        let rx_shared = shared.clone();
        let pace = config.pace;
        let rx_thread = spawn(move || rx_loop(reader, rx_shared, pace));

        let tx_shared = shared.clone();
        let tx_thread = spawn(move || tx_loop(writer, outbound_rx, tx_shared, pace));

        Self {
            shared,
            outbound_tx,
            threads: Mutex::new(vec![rx_thread, tx_thread]),
        }
    }

    /// 把一条命令追加到出站队列尾部
    ///
    /// 非阻塞；命令按提交顺序逐条发送，每条以 `\n` 结尾。
    /// 传输已停机时静默丢弃（故障已通过消息事件报告过一次）。
    pub fn send(&self, command: String) {
        trace!("queue command: {:?}", command);
        let _ = self.outbound_tx.send(command);
    }

    /// 原子地取走自上次轮询以来缓存的全部入站事件，保持到达顺序
    pub fn poll_inbound(&self) -> Vec<InboundEvent> {
        std::mem::take(&mut *self.shared.inbound.lock())
    }

    /// 从成功启动到关闭或发生不可恢复 IO 故障之间为 true
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 通知两个循环停机并等待退出
    ///
    /// 幂等；两个循环最迟在一个间隔（加一次读超时）内观察到标志，
    /// 因此 join 是有界的。
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// 接收线程主循环
///
/// 逐行读取；空读是 no-op，合法前缀的行进入事件缓冲，读故障
/// 报告一次后停机退出。
fn rx_loop(mut reader: impl LineReader, shared: Arc<TransportShared>, pace: Duration) {
    loop {
        if !shared.running.load(Ordering::Acquire) {
            trace!("RX thread: running flag is false, exiting");
            break;
        }

        match reader.read_line() {
            Ok(None) => {},
            Ok(Some(line)) => {
                trace!("RX thread: line {:?}", line);
                if let Some(event) = parse_line(&line) {
                    shared.inbound.lock().push(event);
                }
                // 无法识别前缀的行被 parse_line 静默丢弃
            },
            Err(e) => {
                shared.fail(format!("Error while reading serial port: {e}"));
                break;
            },
        }

        spin_sleep::sleep(pace);
    }
    trace!("RX thread: loop exited");
}

/// 发送线程主循环
///
/// 每个周期从出站队列取一条命令写出；写故障报告一次后停机退出。
fn tx_loop(
    mut writer: impl LineWriter,
    outbound_rx: Receiver<String>,
    shared: Arc<TransportShared>,
    pace: Duration,
) {
    loop {
        if !shared.running.load(Ordering::Acquire) {
            trace!("TX thread: running flag is false, exiting");
            break;
        }

        match outbound_rx.try_recv() {
            Ok(command) => {
                if let Err(e) = writer.write_line(&command) {
                    shared.fail(format!("Error sending command {command:?}: {e}"));
                    break;
                }
                trace!("TX thread: sent {:?}", command);
            },
            Err(TryRecvError::Empty) => {},
            Err(TryRecvError::Disconnected) => {
                trace!("TX thread: command channel disconnected");
                break;
            },
        }

        spin_sleep::sleep(pace);
    }
    trace!("TX thread: loop exited");
}
