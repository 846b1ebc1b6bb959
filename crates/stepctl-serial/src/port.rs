//! `serialport` 后端模块
//!
//! 以固定波特率、短读超时打开物理端口，并用 `try_clone` 分离出
//! 读写两半。读取端逐字节组装行，读超时落在行中间时不丢数据。

use crate::{LineReader, LineWriter, SerialError, SerialLink};
use serialport::{SerialPort, SerialPortInfo};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use stepctl_protocol::BAUD_RATE;
use tracing::trace;

/// 单次 `read` 的阻塞上限，保证读线程能及时观察到停机标志
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 枚举可用物理串口
///
/// 纯查询，不持有状态（构建辅助层用它做端口发现）。
pub fn list_ports() -> Result<Vec<SerialPortInfo>, SerialError> {
    Ok(serialport::available_ports()?)
}

/// 已打开的物理串口连接
pub struct PortLink {
    reader: PortReader,
    writer: PortWriter,
}

impl PortLink {
    /// 打开物理端口
    ///
    /// 波特率固定为 [`BAUD_RATE`]，读超时 100ms。失败时不留任何
    /// 打开状态，调用方可以换端口重试。
    pub fn open(port: &str) -> Result<Self, SerialError> {
        let handle = serialport::new(port, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| SerialError::Open {
                port: port.to_string(),
                source,
            })?;
        let write_half = handle.try_clone()?;
        trace!("opened serial port {} at {} baud", port, BAUD_RATE);
        Ok(Self {
            reader: PortReader {
                port: handle,
                partial: Vec::new(),
            },
            writer: PortWriter { port: write_half },
        })
    }
}

impl SerialLink for PortLink {
    type Reader = PortReader;
    type Writer = PortWriter;

    fn split(self) -> (PortReader, PortWriter) {
        (self.reader, self.writer)
    }
}

/// 物理端口的读取半部
pub struct PortReader {
    port: Box<dyn SerialPort>,
    /// 跨多次读超时累积的未完成行
    partial: Vec<u8>,
}

impl LineReader for PortReader {
    fn read_line(&mut self) -> Result<Option<String>, SerialError> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        let line = String::from_utf8_lossy(&self.partial).into_owned();
                        self.partial.clear();
                        return Ok(Some(line));
                    }
                    self.partial.push(byte[0]);
                },
                // 读超时是常态：保留已累积的半行，下次继续
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SerialError::Io(e)),
            }
        }
    }
}

/// 物理端口的写入半部
pub struct PortWriter {
    port: Box<dyn SerialPort>,
}

impl LineWriter for PortWriter {
    fn write_line(&mut self, line: &str) -> Result<(), SerialError> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }
}
