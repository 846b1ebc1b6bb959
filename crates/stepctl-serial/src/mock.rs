//! Mock 串口后端（无硬件依赖）
//!
//! 用通道模拟一条串口链路：测试侧通过 [`MockHandle`] 注入入站行、
//! 取出已发送的命令、注入 IO 故障。读写两半的行为与物理后端一致：
//! 空读返回 `Ok(None)`，故障返回 `Err`。

use crate::{LineReader, LineWriter, SerialError, SerialLink};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 测试侧控制句柄
///
/// Drop 该句柄会让读取端在下一次读取时观察到 [`SerialError::Disconnected`]，
/// 模拟设备拔出。
#[derive(Clone)]
pub struct MockHandle {
    inbound_tx: Sender<String>,
    sent: Arc<Mutex<Vec<String>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MockHandle {
    /// 注入一行入站数据（设备 → 主机）
    pub fn push_line(&self, line: &str) {
        let _ = self.inbound_tx.send(line.to_string());
    }

    /// 取出并清空已发送的命令（主机 → 设备，不含行终结符）
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// 查看已发送的命令（不清空）
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// 让后续所有读取失败
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::Release);
    }

    /// 让后续所有写入失败
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }
}

/// 通道模拟的串口连接
pub struct MockLink {
    reader: MockReader,
    writer: MockWriter,
}

impl MockLink {
    /// 创建一条 mock 链路及其控制句柄
    pub fn new() -> (Self, MockHandle) {
        let (inbound_tx, inbound_rx) = unbounded();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let fail_reads = Arc::new(AtomicBool::new(false));
        let fail_writes = Arc::new(AtomicBool::new(false));

        let handle = MockHandle {
            inbound_tx,
            sent: sent.clone(),
            fail_reads: fail_reads.clone(),
            fail_writes: fail_writes.clone(),
        };
        let link = MockLink {
            reader: MockReader {
                inbound_rx,
                fail: fail_reads,
            },
            writer: MockWriter { sent, fail: fail_writes },
        };
        (link, handle)
    }
}

impl SerialLink for MockLink {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> (MockReader, MockWriter) {
        (self.reader, self.writer)
    }
}

pub struct MockReader {
    inbound_rx: Receiver<String>,
    fail: Arc<AtomicBool>,
}

impl LineReader for MockReader {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(SerialError::Disconnected);
        }
        match self.inbound_rx.try_recv() {
            Ok(line) => Ok(Some(line)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SerialError::Disconnected),
        }
    }
}

pub struct MockWriter {
    sent: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicBool>,
}

impl LineWriter for MockWriter {
    fn write_line(&mut self, line: &str) -> Result<(), SerialError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(SerialError::Disconnected);
        }
        self.sent.lock().push(line.to_string());
        Ok(())
    }
}
