//! 电机控制器模块
//!
//! 提供对外的 [`MotorController`] 结构体，封装会话管理细节：
//! 验证握手、带方向锁的步进命令、以及"每条查询恰好一条回复"的
//! FIFO 关联。一个后台时钟线程驱动协议推进：每个 tick 轮询传输层
//! 的入站事件、推进状态机、执行超时清扫。
//!
//! ## 回复匹配规则
//!
//! 入站数值回复有两条匹配路径，FIFO 队列优先：
//!
//! 1. 待回复队列非空时，最老的查询命令认领下一条数值；
//! 2. 队列为空时，数值按当前状态解释（验证回复、步进目标、
//!    完成步数）。验证 / 步进回复不入队，只由状态键控 —— 这是
//!    对 FIFO 规则唯一的、有意保留的例外。

use crate::error::DriverError;
use crate::pending::{PendingCommand, ResolutionSink};
use crate::state::MotorState;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use stepctl_protocol::{Command, InboundEvent, MIN_STEP_DELAY, VALIDATION_OK};
use stepctl_serial::{SerialLink, SerialTransport, TransportConfig};
use tracing::{trace, warn};

/// 消息回调：接收设备文本和控制器内部通知
///
/// 从时钟线程调用，必须快速返回，不得阻塞。
pub type MessageSink = Arc<dyn Fn(&str) + Send + Sync>;

/// 控制器配置
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stepctl_driver::ControllerConfig;
///
/// // 默认配置（5s 超时，1s 安置延时，100ms 时钟间隔）
/// let config = ControllerConfig::default();
///
/// // 测试中收紧时序
/// let config = ControllerConfig {
///     timeout: Duration::from_millis(300),
///     settle_delay: Duration::from_millis(10),
///     tick: Duration::from_millis(5),
///     ..ControllerConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// 回复超时窗口：同时约束验证 / 步进看门狗和单条查询的过期
    pub timeout: Duration,
    /// 打开端口后、发出验证探测前的安置延时（固件上电初始化）
    pub settle_delay: Duration,
    /// 时钟线程的循环间隔，必须远小于 `timeout`
    pub tick: Duration,
    /// 传输层配置
    pub transport: TransportConfig,
    /// 调试模式：所有收发流量回显到消息回调
    pub debug: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            tick: Duration::from_millis(100),
            transport: TransportConfig::default(),
            debug: false,
        }
    }
}

/// 时钟线程与命令 API 共享的可变状态
///
/// `state`、待回复队列和运动意图字段都在同一把锁下：命令 API 和
/// 时钟线程执行的是同一套控制器逻辑，不需要更细的锁分区。
struct Core {
    state: MotorState,
    /// 待回复命令队列，严格 FIFO 消解
    pending: VecDeque<PendingCommand>,
    /// 方向锁：步进期间只接受同向追加
    forwards: bool,
    /// 最近一次请求的步数幅值（含同向追加的累积）
    last_step_command: i64,
    /// 设备最近回报的完成步数；新一轮步进开始时清空
    last_step_count: Option<i64>,
    /// 设备回报的步进目标
    step_target: i64,
    /// 验证 / 步进看门狗的到期时刻；`None` 表示未在等待
    deadline: Option<Instant>,
}

struct Shared {
    core: Mutex<Core>,
    config: ControllerConfig,
    sink: MessageSink,
    /// 显式拆除标志：时钟线程据此区分主动关闭与连接丢失
    explicit_stop: AtomicBool,
}

/// 串口步进电机控制器（对外 API）
///
/// 每个实例至多持有一个活动连接。所有方法都是 `&self`；
/// 阻塞查询只阻塞调用方线程，永远不阻塞时钟线程。
pub struct MotorController {
    port: String,
    shared: Arc<Shared>,
    /// 会话生命周期锁：运行检查、安装与拆除在此锁下原子化。
    /// 锁序最外层，先于 `transport`，再先于 `core`。
    session: Mutex<()>,
    transport: Mutex<Option<Arc<SerialTransport>>>,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl MotorController {
    pub(crate) fn new(port: String, config: ControllerConfig, sink: MessageSink) -> Self {
        Self {
            port,
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: MotorState::Invalid,
                    pending: VecDeque::new(),
                    forwards: true,
                    last_step_command: 0,
                    last_step_count: None,
                    step_target: 0,
                    deadline: None,
                }),
                config,
                sink,
                explicit_stop: AtomicBool::new(false),
            }),
            session: Mutex::new(()),
            transport: Mutex::new(None),
            clock: Mutex::new(None),
        }
    }

    /// 通信端口名
    pub fn port(&self) -> &str {
        &self.port
    }

    // ------------------------------------------------------------
    // 连接生命周期
    // ------------------------------------------------------------

    /// 建立与电机的连接
    ///
    /// 打开物理端口，启动时钟线程，等待安置延时后发出验证探测。
    /// 已在运行时幂等返回 `true`；打开失败返回 `false`，不启动
    /// 任何循环，失败原因经消息回调报告。
    pub fn start_connection(&self) -> bool {
        match self.try_start_connection() {
            Ok(running) => running,
            Err(e) => {
                warn!("failed to start connection on {}: {}", self.port, e);
                (self.shared.sink)(&format!("Failed to open serial port {}: {e}", self.port));
                false
            },
        }
    }

    /// [`start_connection`](Self::start_connection) 的 `Result` 形式
    pub fn try_start_connection(&self) -> Result<bool, DriverError> {
        let _session = self.session.lock();
        if self.session_running() {
            return Ok(true);
        }
        let transport =
            SerialTransport::connect(&self.port, self.shared.config.transport.clone())?;
        self.begin_session(Arc::new(transport));
        Ok(true)
    }

    /// 在已建立的链路上启动会话（跳过物理端口打开）
    ///
    /// 测试通过 mock 链路从这里驱动完整协议栈。
    pub fn start_connection_with<L>(&self, link: L) -> bool
    where
        L: SerialLink,
    {
        let _session = self.session.lock();
        if self.session_running() {
            return true;
        }
        let transport = SerialTransport::start(link, self.shared.config.transport.clone());
        self.begin_session(Arc::new(transport));
        true
    }

    fn session_running(&self) -> bool {
        let guard = self.transport.lock();
        matches!(guard.as_ref(), Some(transport) if transport.is_running())
    }

    /// 调用方必须持有会话锁
    fn begin_session(&self, transport: Arc<SerialTransport>) {
        // 回收上一个会话的时钟线程（若有，必定已退出）
        if let Some(handle) = self.clock.lock().take() {
            let _ = handle.join();
        }
        self.shared.explicit_stop.store(false, Ordering::Release);
        *self.transport.lock() = Some(transport.clone());
        {
            let mut core = self.shared.core.lock();
            core.state = MotorState::Invalid;
            core.deadline = None;
        }

        let shared = self.shared.clone();
        let clock_transport = transport.clone();
        *self.clock.lock() = Some(spawn(move || clock_loop(shared, clock_transport)));

        // 安置延时：给固件上电初始化留时间，随后进入验证
        spin_sleep::sleep(self.shared.config.settle_delay);
        // 安置期间收到拆除请求时不再发探测，状态停留在 Invalid，
        // 等待中的 stop_connection 接手清理
        if self.shared.explicit_stop.load(Ordering::Acquire) {
            return;
        }
        let mut notices = Vec::new();
        {
            let mut core = self.shared.core.lock();
            core.state = MotorState::Validating;
            core.deadline = Some(Instant::now() + self.shared.config.timeout);
            self.dispatch(&transport, Command::Validate, &mut notices);
        }
        self.emit(&notices);
    }

    /// 拆除连接
    ///
    /// 幂等。所有待回复命令以哨兵批量消解，状态回到 `Invalid`，
    /// 三个循环全部停机。之后可再次 `start_connection` 重连。
    pub fn stop_connection(&self) {
        // 标志先于会话锁：正在安置延时中的启动观察到后放弃发探测
        self.shared.explicit_stop.store(true, Ordering::Release);
        let _session = self.session.lock();
        let transport = self.transport.lock().take();
        let mut orphaned = Vec::new();
        {
            let mut core = self.shared.core.lock();
            core.state = MotorState::Invalid;
            core.deadline = None;
            orphaned.extend(core.pending.drain(..));
        }
        for pending in orphaned {
            pending.resolve(None);
        }
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(handle) = self.clock.lock().take() {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------
    // 运动命令
    // ------------------------------------------------------------

    /// 命令电机执行若干步
    ///
    /// 正数顺时针，负数逆时针，零被忽略。空闲时锁定方向并发出
    /// `forwards`/`backwards`、`step <n>`、`start` 三条命令；
    /// 步进中只接受同向追加，反向请求被拒绝并产生一条警告消息
    /// （电机必须先减速停止才能换向）。
    ///
    /// 超出固件量程（`u32::MAX`）的幅值被截到上限并产生一条警告，
    /// `last_step_command` 记录的是实际发往线上的幅值。
    pub fn do_steps(&self, steps: i64) {
        if steps == 0 {
            return;
        }
        let mut notices = Vec::new();
        {
            let transport_guard = self.transport.lock();
            let Some(transport) = transport_guard.as_ref() else {
                return;
            };
            let mut core = self.shared.core.lock();
            if !core.state.is_valid() {
                return;
            }
            if core.state.is_stepping() {
                if core.forwards == (steps > 0) {
                    // 同向追加：只累积幅值，状态深度不变
                    let magnitude = step_magnitude(steps, &mut notices);
                    core.last_step_command =
                        core.last_step_command.saturating_add(i64::from(magnitude));
                    self.dispatch(transport, Command::Step(magnitude), &mut notices);
                } else {
                    notices.push(
                        "Motor is currently stepping in the opposite direction, ignoring command"
                            .to_string(),
                    );
                }
            } else {
                core.forwards = steps > 0;
                let direction = if core.forwards {
                    Command::Forwards
                } else {
                    Command::Backwards
                };
                self.dispatch(transport, direction, &mut notices);
                let magnitude = step_magnitude(steps, &mut notices);
                core.last_step_count = None;
                core.last_step_command = i64::from(magnitude);
                self.dispatch(transport, Command::Step(magnitude), &mut notices);
                core.state = MotorState::AwaitStepping;
                core.deadline = Some(Instant::now() + self.shared.config.timeout);
                self.dispatch(transport, Command::Start, &mut notices);
            }
        }
        self.emit(&notices);
    }

    /// 与 [`do_steps`](Self::do_steps) 相同，但阻塞到步进结束
    ///
    /// 返回设备回报的完成步数；连接丢失或超时返回 `None`。
    pub fn do_steps_and_wait(&self, steps: i64) -> Option<i64> {
        self.do_steps(steps);
        while self.is_stepping() {
            spin_sleep::sleep(Duration::from_millis(50));
        }
        self.last_step_count()
    }

    /// 命令电机停止步进
    ///
    /// 立即回到 `Standby`，不等待设备确认；看门狗时间戳清除。
    pub fn stop_stepping(&self) {
        let mut notices = Vec::new();
        {
            let transport_guard = self.transport.lock();
            let Some(transport) = transport_guard.as_ref() else {
                return;
            };
            let mut core = self.shared.core.lock();
            if !core.state.is_stepping() {
                return;
            }
            core.state = MotorState::Standby;
            core.deadline = None;
            self.dispatch(transport, Command::Stop, &mut notices);
        }
        self.emit(&notices);
    }

    /// 设置步进延时，小于固件下限的值被钳到 [`MIN_STEP_DELAY`]
    pub fn set_step_delay(&self, delay: u32) {
        let delay = delay.max(MIN_STEP_DELAY);
        let mut notices = Vec::new();
        {
            let transport_guard = self.transport.lock();
            let Some(transport) = transport_guard.as_ref() else {
                return;
            };
            self.dispatch(transport, Command::SetDelay(delay), &mut notices);
        }
        self.emit(&notices);
    }

    // ------------------------------------------------------------
    // 阻塞查询（只阻塞调用方线程）
    // ------------------------------------------------------------

    /// 查询当前步数；超时或连接无效返回 `None`
    pub fn get_step_count(&self) -> Option<i64> {
        self.query_blocking(Command::GetStepCount)
    }

    /// 查询步进目标；超时或连接无效返回 `None`
    pub fn get_step_target(&self) -> Option<i64> {
        self.query_blocking(Command::GetStepTarget)
    }

    /// 查询当前步进延时；超时或连接无效返回 `None`
    pub fn get_delay(&self) -> Option<i64> {
        self.query_blocking(Command::GetDelay)
    }

    /// 查询电机是否顺时针运行；超时或连接无效返回 `None`
    pub fn is_forwards(&self) -> Option<bool> {
        self.query_blocking(Command::IsForward).map(|v| v != 0)
    }

    /// 查询电机是否逆时针运行；超时或连接无效返回 `None`
    pub fn is_backwards(&self) -> Option<bool> {
        self.query_blocking(Command::IsBackward).map(|v| v != 0)
    }

    // ------------------------------------------------------------
    // 回调查询（不阻塞调用方）
    // ------------------------------------------------------------

    /// 查询当前步数，回复到达时在时钟线程上调用回调恰好一次
    ///
    /// 超时或连接无效时回调收到 `None`。回调必须快速返回，
    /// 不得阻塞，也不得在其中发起阻塞查询。
    pub fn poll_step_count(&self, callback: impl FnOnce(Option<i64>) + Send + 'static) {
        self.submit(Command::GetStepCount, ResolutionSink::Callback(Box::new(callback)));
    }

    /// 查询步进目标，回调约定同 [`poll_step_count`](Self::poll_step_count)
    pub fn poll_step_target(&self, callback: impl FnOnce(Option<i64>) + Send + 'static) {
        self.submit(Command::GetStepTarget, ResolutionSink::Callback(Box::new(callback)));
    }

    /// 查询步进延时，回调约定同 [`poll_step_count`](Self::poll_step_count)
    pub fn poll_delay(&self, callback: impl FnOnce(Option<i64>) + Send + 'static) {
        self.submit(Command::GetDelay, ResolutionSink::Callback(Box::new(callback)));
    }

    /// 查询是否顺时针运行，回调约定同 [`poll_step_count`](Self::poll_step_count)
    pub fn poll_forwards(&self, callback: impl FnOnce(Option<i64>) + Send + 'static) {
        self.submit(Command::IsForward, ResolutionSink::Callback(Box::new(callback)));
    }

    /// 查询是否逆时针运行，回调约定同 [`poll_step_count`](Self::poll_step_count)
    pub fn poll_backwards(&self, callback: impl FnOnce(Option<i64>) + Send + 'static) {
        self.submit(Command::IsBackward, ResolutionSink::Callback(Box::new(callback)));
    }

    // ------------------------------------------------------------
    // 本地状态访问（不产生线上流量）
    // ------------------------------------------------------------

    /// 连接有效（已通过验证）
    pub fn is_valid(&self) -> bool {
        self.shared.core.lock().state.is_valid()
    }

    /// 正在验证
    pub fn is_validating(&self) -> bool {
        self.shared.core.lock().state.is_validating()
    }

    /// 有效或正在验证
    pub fn is_valid_or_validating(&self) -> bool {
        self.shared.core.lock().state.is_valid_or_validating()
    }

    /// 正在步进
    pub fn is_stepping(&self) -> bool {
        self.shared.core.lock().state.is_stepping()
    }

    /// 最近一次请求的步数幅值（含同向追加的累积）
    pub fn last_step_command(&self) -> i64 {
        self.shared.core.lock().last_step_command
    }

    /// 设备最近回报的完成步数；本轮步进尚未结束时为 `None`
    pub fn last_step_count(&self) -> Option<i64> {
        self.shared.core.lock().last_step_count
    }

    /// 设备回报的步进目标
    pub fn step_target(&self) -> i64 {
        self.shared.core.lock().step_target
    }

    /// 当前方向锁（true 为顺时针）
    pub fn forwards(&self) -> bool {
        self.shared.core.lock().forwards
    }

    // ------------------------------------------------------------
    // 内部
    // ------------------------------------------------------------

    /// 提交一条期望回复的查询命令
    ///
    /// 会话有效时：先入队、后发送（保证 FIFO 匹配次序）；
    /// 无效时：立即以哨兵消解，不产生线上流量。
    fn submit(&self, command: Command, sink: ResolutionSink) {
        debug_assert!(command.expects_value());
        let mut notices = Vec::new();
        let mut immediate = None;
        {
            let transport_guard = self.transport.lock();
            let mut core = self.shared.core.lock();
            match transport_guard.as_ref() {
                Some(transport) if core.state.is_valid() && transport.is_running() => {
                    core.pending.push_back(PendingCommand::new(sink));
                    self.dispatch(transport, command, &mut notices);
                },
                _ => immediate = Some(sink),
            }
        }
        if let Some(sink) = immediate {
            sink.resolve(None);
        }
        self.emit(&notices);
    }

    fn query_blocking(&self, command: Command) -> Option<i64> {
        let (tx, rx) = bounded(1);
        self.submit(command, ResolutionSink::Slot(tx));
        // 正常情况下由时钟线程的超时清扫消解；这里的额外宽限
        // 只兜底时钟线程已经退出的窗口
        let grace = self.shared.config.timeout + self.shared.config.tick * 2;
        match rx.recv_timeout(grace) {
            Ok(value) => value,
            Err(_) => None,
        }
    }

    /// 渲染并发送一条命令；调试回显先收集，锁外统一投递
    fn dispatch(&self, transport: &SerialTransport, command: Command, notices: &mut Vec<String>) {
        let line = command.to_string();
        if self.shared.config.debug {
            notices.push(format!("[DEBUG] Sending command: {line:?}"));
        }
        transport.send(line);
    }

    /// 锁外投递消息，避免回调重入控制器时死锁
    fn emit(&self, notices: &[String]) {
        for notice in notices {
            (self.shared.sink)(notice.as_str());
        }
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.stop_connection();
    }
}

/// 时钟线程主循环
///
/// 每个 tick：轮询传输层入站事件并路由，然后做超时清扫。
/// 退出路径有三条：显式拆除（静默）、传输停机（报告
/// "Connection lost"）、看门狗超时（报告 "Connection timed out"
/// 并拆除连接）。
fn clock_loop(shared: Arc<Shared>, transport: Arc<SerialTransport>) {
    loop {
        if shared.explicit_stop.load(Ordering::Acquire) {
            trace!("clock thread: explicit stop, exiting");
            return;
        }

        if !transport.is_running() {
            // 停机可能是 stop_connection 刚关闭了传输，不是故障
            if shared.explicit_stop.load(Ordering::Acquire) {
                trace!("clock thread: explicit stop, exiting");
                return;
            }
            // 传输因 IO 故障停机：先透传缓冲里最后的事件（含故障
            // 通知），再宣告连接丢失并批量消解待回复命令
            let events = transport.poll_inbound();
            let mut notices = Vec::new();
            let mut resolutions = Vec::new();
            {
                let mut core = shared.core.lock();
                for event in events {
                    route_event(&shared, &mut core, event, &mut notices, &mut resolutions);
                }
                core.state = MotorState::Invalid;
                core.deadline = None;
                resolutions.extend(core.pending.drain(..).map(|p| (p, None)));
            }
            notices.push("Connection lost".to_string());
            for notice in &notices {
                (shared.sink)(notice.as_str());
            }
            for (pending, value) in resolutions {
                pending.resolve(value);
            }
            trace!("clock thread: transport stopped, exiting");
            return;
        }

        let events = transport.poll_inbound();
        let mut notices = Vec::new();
        let mut resolutions = Vec::new();
        let mut timed_out = false;
        {
            let mut core = shared.core.lock();
            for event in events {
                route_event(&shared, &mut core, event, &mut notices, &mut resolutions);
            }
            sweep_timeouts(&shared, &mut core, &mut notices, &mut resolutions, &mut timed_out);
        }
        for notice in &notices {
            (shared.sink)(notice.as_str());
        }
        for (pending, value) in resolutions {
            pending.resolve(value);
        }

        if timed_out {
            // 超时是不可恢复故障：拆除连接，调用方需重新建连
            transport.close();
            trace!("clock thread: watchdog timed out, connection torn down");
            return;
        }

        spin_sleep::sleep(shared.config.tick);
    }
}

/// 请求步数换算为线上幅值
///
/// `unsigned_abs` 覆盖 `i64::MIN`；超出固件量程的幅值截到
/// `u32::MAX` 并产生一条警告，保证线上命令与本地记录一致。
fn step_magnitude(steps: i64, notices: &mut Vec<String>) -> u32 {
    let magnitude = steps.unsigned_abs();
    u32::try_from(magnitude).unwrap_or_else(|_| {
        notices.push(format!(
            "Step count {magnitude} exceeds the firmware limit, clamping to {}",
            u32::MAX
        ));
        u32::MAX
    })
}

/// 把一条入站事件路由到待回复队列或状态机
fn route_event(
    shared: &Shared,
    core: &mut Core,
    event: InboundEvent,
    notices: &mut Vec<String>,
    resolutions: &mut Vec<(PendingCommand, Option<i64>)>,
) {
    match event {
        InboundEvent::Message(text) => notices.push(text),
        InboundEvent::InvalidValue(raw) => {
            notices.push(format!("Received invalid value: {raw}"));
        },
        InboundEvent::Value(value) => {
            if shared.config.debug {
                notices.push(format!("[DEBUG] Received value: {value}"));
            }
            // FIFO 队列优先：最老的查询认领回复
            if let Some(pending) = core.pending.pop_front() {
                resolutions.push((pending, Some(value)));
                return;
            }
            // 队列为空：回复按当前状态解释
            match core.state {
                MotorState::Validating => {
                    if value == VALIDATION_OK {
                        core.state = MotorState::Standby;
                        core.deadline = None;
                        trace!("validation passed");
                    }
                    // 其他值不迁移状态，等待看门狗裁决
                },
                MotorState::AwaitStepping => {
                    core.step_target = value;
                    core.state = MotorState::Stepping;
                    core.deadline = None;
                },
                MotorState::Stepping => {
                    core.last_step_count = Some(value);
                    core.state = MotorState::Standby;
                },
                MotorState::Standby | MotorState::Invalid => {
                    notices.push("Error: received a value without commands".to_string());
                },
            }
        },
    }
}

/// 超时清扫
///
/// 先查全局看门狗（验证 / 步进等待），命中则整体拆除；
/// 否则逐条检查待回复命令自身的年龄，过期的以哨兵消解。
fn sweep_timeouts(
    shared: &Shared,
    core: &mut Core,
    notices: &mut Vec<String>,
    resolutions: &mut Vec<(PendingCommand, Option<i64>)>,
    timed_out: &mut bool,
) {
    if let Some(deadline) = core.deadline
        && Instant::now() >= deadline
    {
        warn!("no qualifying reply within {:?}, tearing down", shared.config.timeout);
        notices.push("Connection timed out".to_string());
        core.state = MotorState::Invalid;
        core.deadline = None;
        resolutions.extend(core.pending.drain(..).map(|p| (p, None)));
        *timed_out = true;
        return;
    }

    let timeout = shared.config.timeout;
    let mut index = 0;
    while index < core.pending.len() {
        if core.pending[index].is_expired(timeout) {
            if let Some(pending) = core.pending.remove(index) {
                resolutions.push((pending, None));
            }
        } else {
            index += 1;
        }
    }
}
