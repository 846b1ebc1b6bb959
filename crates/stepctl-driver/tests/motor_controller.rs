//! 电机控制器集成测试
//!
//! 通过 mock 链路驱动完整协议栈（传输层双线程 + 时钟线程），
//! 覆盖验证握手、步进命令序列、方向锁、FIFO 回复关联、
//! 超时清扫与连接拆除。

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stepctl_driver::{MotorController, MotorControllerBuilder, TransportConfig};
use stepctl_serial::{MockHandle, MockLink};

/// 测试里所有"等待某条件"的统一上限
const WAIT_LIMIT: Duration = Duration::from_secs(2);

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

struct Fixture {
    controller: MotorController,
    handle: MockHandle,
    messages: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn message_received(&self, expected: &str) -> bool {
        self.messages.lock().iter().any(|m| m == expected)
    }

    fn command_sent(&self, expected: &str) -> bool {
        self.handle.sent().iter().any(|l| l == expected)
    }

    /// 走完验证握手，结束于 `Standby`
    fn validate(&self) {
        assert!(
            wait_until(WAIT_LIMIT, || self.command_sent("stepper_control")),
            "validation probe was not sent"
        );
        self.handle.push_line("[v]1");
        assert!(
            wait_until(WAIT_LIMIT, || self.controller.is_valid()),
            "controller did not become valid"
        );
        self.handle.take_sent();
    }
}

/// 用收紧的时序参数建连（timeout 300ms / settle 10ms / tick 5ms）
fn connect(debug: bool) -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_messages = messages.clone();
    let controller = MotorControllerBuilder::new("mock0")
        .timeout(Duration::from_millis(300))
        .settle_delay(Duration::from_millis(10))
        .tick(Duration::from_millis(5))
        .transport(TransportConfig {
            pace: Duration::from_millis(2),
        })
        .debug(debug)
        .message_sink(move |msg| sink_messages.lock().push(msg.to_string()))
        .build();
    let (link, handle) = MockLink::new();
    assert!(controller.start_connection_with(link));
    Fixture {
        controller,
        handle,
        messages,
    }
}

#[test]
fn test_validation_handshake_succeeds() {
    let fixture = connect(false);
    assert!(fixture.controller.is_validating());

    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("stepper_control")));
    fixture.handle.push_line("[v]1");
    assert!(wait_until(WAIT_LIMIT, || fixture.controller.is_valid()));
    assert!(!fixture.controller.is_stepping());
}

#[test]
fn test_validation_times_out_without_reply() {
    let fixture = connect(false);
    assert!(wait_until(WAIT_LIMIT, || {
        fixture.message_received("Connection timed out")
    }));
    assert!(!fixture.controller.is_valid_or_validating());
    // 超时后会话不可用，查询立即以哨兵返回
    assert_eq!(fixture.controller.get_step_count(), None);
}

#[test]
fn test_open_failure_reports_and_stays_invalid() {
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_messages = messages.clone();
    let controller = MotorControllerBuilder::new("/definitely/not/a/port")
        .settle_delay(Duration::from_millis(10))
        .message_sink(move |msg| sink_messages.lock().push(msg.to_string()))
        .build();

    assert!(!controller.start_connection());
    assert!(!controller.is_valid_or_validating());
    assert!(
        messages
            .lock()
            .iter()
            .any(|m| m.starts_with("Failed to open serial port"))
    );

    // 无连接时查询立即返回，不等满超时窗口
    let start = Instant::now();
    assert_eq!(controller.get_step_count(), None);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_do_steps_backwards_sends_command_sequence() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(-20);
    assert!(wait_until(WAIT_LIMIT, || fixture.handle.sent().len() >= 3));
    assert_eq!(
        fixture.handle.sent(),
        vec!["backwards".to_string(), "step 20".to_string(), "start".to_string()]
    );
    assert_eq!(fixture.controller.last_step_command(), 20);
    assert!(!fixture.controller.forwards());
    assert!(fixture.controller.is_stepping());
    // 新一轮步进清空上一轮的完成回报
    assert_eq!(fixture.controller.last_step_count(), None);
}

#[test]
fn test_stepping_round_trip() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(50);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    assert!(fixture.command_sent("forwards"));
    assert!(fixture.command_sent("step 50"));

    // 设备回报步进目标
    fixture.handle.push_line("[v]30");
    assert!(wait_until(WAIT_LIMIT, || fixture.controller.step_target() == 30));
    assert!(fixture.controller.is_stepping());

    // 设备回报完成步数，回到空闲
    fixture.handle.push_line("[v]50");
    assert!(wait_until(WAIT_LIMIT, || !fixture.controller.is_stepping()));
    assert_eq!(fixture.controller.last_step_count(), Some(50));
    assert!(fixture.controller.is_valid());
}

#[test]
fn test_opposite_direction_is_rejected_while_stepping() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(40);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    let sent_before = fixture.handle.sent();

    fixture.controller.do_steps(-10);
    assert!(fixture.message_received(
        "Motor is currently stepping in the opposite direction, ignoring command"
    ));
    // 拒绝的命令不产生任何线上流量，也不改动运动意图
    assert_eq!(fixture.handle.sent(), sent_before);
    assert_eq!(fixture.controller.last_step_command(), 40);
    assert!(fixture.controller.is_stepping());
}

#[test]
fn test_same_direction_extension_accumulates() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(40);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    fixture.handle.push_line("[v]40");
    assert!(wait_until(WAIT_LIMIT, || fixture.controller.step_target() == 40));

    fixture.controller.do_steps(30);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("step 30")));
    assert_eq!(fixture.controller.last_step_command(), 70);
    // 追加不重发方向和 start，状态深度不变
    let sent = fixture.handle.sent();
    assert_eq!(sent.iter().filter(|l| *l == "start").count(), 1);
    assert_eq!(sent.iter().filter(|l| l.starts_with("forwards")).count(), 1);
    assert!(fixture.controller.is_stepping());
}

#[test]
fn test_callback_queries_resolve_in_fifo_order() {
    let fixture = connect(false);
    fixture.validate();

    let observed: Arc<Mutex<Vec<(&'static str, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let o1 = observed.clone();
    let o2 = observed.clone();
    let o3 = observed.clone();
    fixture.controller.poll_step_count(move |v| o1.lock().push(("count", v)));
    fixture.controller.poll_step_target(move |v| o2.lock().push(("target", v)));
    fixture.controller.poll_delay(move |v| o3.lock().push(("delay", v)));

    assert!(wait_until(WAIT_LIMIT, || fixture.handle.sent().len() >= 3));
    fixture.handle.push_line("[v]5");
    fixture.handle.push_line("[v]6");
    fixture.handle.push_line("[v]7");

    assert!(wait_until(WAIT_LIMIT, || observed.lock().len() == 3));
    assert_eq!(
        *observed.lock(),
        vec![("count", Some(5)), ("target", Some(6)), ("delay", Some(7))]
    );
}

#[test]
fn test_blocking_query_returns_device_value() {
    let fixture = connect(false);
    fixture.validate();

    let handle = fixture.handle.clone();
    let responder = thread::spawn(move || {
        assert!(wait_until(WAIT_LIMIT, || {
            handle.sent().iter().any(|l| l == "getStepCount")
        }));
        handle.push_line("[v]123");
    });

    assert_eq!(fixture.controller.get_step_count(), Some(123));
    responder.join().unwrap();
}

#[test]
fn test_boolean_queries_map_wire_integers() {
    let fixture = connect(false);
    fixture.validate();

    let handle = fixture.handle.clone();
    let responder = thread::spawn(move || {
        assert!(wait_until(WAIT_LIMIT, || {
            handle.sent().iter().any(|l| l == "isForward")
        }));
        handle.push_line("[v]1");
        assert!(wait_until(WAIT_LIMIT, || {
            handle.sent().iter().any(|l| l == "isBackward")
        }));
        handle.push_line("[v]0");
    });

    assert_eq!(fixture.controller.is_forwards(), Some(true));
    assert_eq!(fixture.controller.is_backwards(), Some(false));
    responder.join().unwrap();
}

#[test]
fn test_unanswered_query_expires_with_sentinel() {
    let fixture = connect(false);
    fixture.validate();

    let start = Instant::now();
    assert_eq!(fixture.controller.get_delay(), None);
    let elapsed = start.elapsed();
    // 超时窗口结束之前绝不消解
    assert!(elapsed >= Duration::from_millis(300), "resolved too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "resolved too late: {elapsed:?}");
    // 查询超时不触碰全局看门狗，会话保持有效
    assert!(fixture.controller.is_valid());
}

#[test]
fn test_set_step_delay_clamps_to_firmware_minimum() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.set_step_delay(0);
    fixture.controller.set_step_delay(10);
    assert!(wait_until(WAIT_LIMIT, || fixture.handle.sent().len() >= 2));
    assert_eq!(fixture.handle.sent(), vec!["delay 2".to_string(), "delay 10".to_string()]);
}

#[test]
fn test_stop_stepping_returns_to_standby() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(100);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    assert!(fixture.controller.is_stepping());

    fixture.controller.stop_stepping();
    assert!(!fixture.controller.is_stepping());
    assert!(fixture.controller.is_valid());
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("stop")));

    // 空闲时重复调用无副作用
    let sent_before = fixture.handle.sent();
    fixture.controller.stop_stepping();
    assert_eq!(fixture.handle.sent(), sent_before);
}

#[test]
fn test_stop_connection_is_idempotent_and_allows_reconnect() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.stop_connection();
    assert!(!fixture.controller.is_valid_or_validating());
    fixture.controller.stop_connection();

    // 显式拆除静默退出，不得误报连接丢失
    thread::sleep(Duration::from_millis(30));
    assert!(!fixture.message_received("Connection lost"));

    // 拆除后可用新链路重连并重新验证
    let (link, handle) = MockLink::new();
    assert!(fixture.controller.start_connection_with(link));
    assert!(wait_until(WAIT_LIMIT, || {
        handle.sent().iter().any(|l| l == "stepper_control")
    }));
    handle.push_line("[v]1");
    assert!(wait_until(WAIT_LIMIT, || fixture.controller.is_valid()));
}

#[test]
fn test_pending_queries_flush_on_teardown() {
    let fixture = connect(false);
    fixture.validate();

    let observed: Arc<Mutex<Vec<Option<i64>>>> = Arc::new(Mutex::new(Vec::new()));
    let o = observed.clone();
    fixture.controller.poll_step_count(move |v| o.lock().push(v));
    assert!(wait_until(WAIT_LIMIT, || !fixture.handle.sent().is_empty()));

    fixture.controller.stop_connection();
    assert_eq!(*observed.lock(), vec![None]);
}

#[test]
fn test_io_failure_reports_connection_lost() {
    let fixture = connect(false);
    fixture.validate();

    fixture.handle.fail_reads();
    assert!(wait_until(WAIT_LIMIT, || {
        fixture.message_received("Connection lost")
    }));
    assert!(!fixture.controller.is_valid_or_validating());
}

#[test]
fn test_device_messages_pass_through_to_sink() {
    let fixture = connect(false);
    fixture.validate();

    fixture.handle.push_line("[m]Motor stalled");
    assert!(wait_until(WAIT_LIMIT, || fixture.message_received("Motor stalled")));
}

#[test]
fn test_spurious_value_is_reported_not_crashed() {
    let fixture = connect(false);
    fixture.validate();

    fixture.handle.push_line("[v]9");
    assert!(wait_until(WAIT_LIMIT, || {
        fixture.message_received("Error: received a value without commands")
    }));
    assert!(fixture.controller.is_valid());
}

#[test]
fn test_oversized_step_request_is_clamped_to_firmware_limit() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(5_000_000_000);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    // 线上命令与本地记录一致：都被截到固件量程上限
    assert_eq!(
        fixture.handle.sent(),
        vec![
            "forwards".to_string(),
            format!("step {}", u32::MAX),
            "start".to_string()
        ]
    );
    assert_eq!(fixture.controller.last_step_command(), i64::from(u32::MAX));
    assert!(
        fixture
            .messages
            .lock()
            .iter()
            .any(|m| m.contains("exceeds the firmware limit"))
    );
}

#[test]
fn test_extreme_negative_step_request_does_not_panic() {
    let fixture = connect(false);
    fixture.validate();

    fixture.controller.do_steps(i64::MIN);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("start")));
    let sent = fixture.handle.sent();
    assert_eq!(sent[0], "backwards");
    assert_eq!(sent[1], format!("step {}", u32::MAX));
    assert!(!fixture.controller.forwards());
    assert_eq!(fixture.controller.last_step_command(), i64::from(u32::MAX));

    // 同向追加在极值之上继续累积且不溢出
    fixture.controller.do_steps(-10);
    assert!(wait_until(WAIT_LIMIT, || fixture.command_sent("step 10")));
    assert_eq!(fixture.controller.last_step_command(), i64::from(u32::MAX) + 10);
}

#[test]
fn test_concurrent_start_installs_single_session() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let controller = Arc::new(
        MotorControllerBuilder::new("mock0")
            .timeout(Duration::from_millis(300))
            .settle_delay(Duration::from_millis(10))
            .tick(Duration::from_millis(5))
            .transport(TransportConfig {
                pace: Duration::from_millis(2),
            })
            .build(),
    );
    let (link_a, handle_a) = MockLink::new();
    let (link_b, handle_b) = MockLink::new();

    let c1 = controller.clone();
    let c2 = controller.clone();
    let t1 = thread::spawn(move || c1.start_connection_with(link_a));
    let t2 = thread::spawn(move || c2.start_connection_with(link_b));
    assert!(t1.join().unwrap());
    assert!(t2.join().unwrap());

    // 恰好一条链路收到验证探测，另一条不产生任何流量
    assert!(wait_until(WAIT_LIMIT, || {
        let probes = [&handle_a, &handle_b]
            .iter()
            .filter(|h| h.sent().iter().any(|l| l == "stepper_control"))
            .count();
        probes == 1
    }));
    thread::sleep(Duration::from_millis(30));
    let probes = [&handle_a, &handle_b]
        .iter()
        .filter(|h| h.sent().iter().any(|l| l == "stepper_control"))
        .count();
    assert_eq!(probes, 1);

    // 获胜的链路走完握手即有效
    let winner = if handle_a.sent().is_empty() { &handle_b } else { &handle_a };
    winner.push_line("[v]1");
    assert!(wait_until(WAIT_LIMIT, || controller.is_valid()));
}

#[test]
fn test_stop_during_startup_leaves_clean_invalid_state() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_messages = messages.clone();
    let controller = Arc::new(
        MotorControllerBuilder::new("mock0")
            .timeout(Duration::from_millis(300))
            .settle_delay(Duration::from_millis(50))
            .tick(Duration::from_millis(5))
            .transport(TransportConfig {
                pace: Duration::from_millis(2),
            })
            .message_sink(move |msg| sink_messages.lock().push(msg.to_string()))
            .build(),
    );
    let (link, _handle) = MockLink::new();

    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
    let starter = {
        let controller = controller.clone();
        thread::spawn(move || {
            ready_tx.send(()).unwrap();
            controller.start_connection_with(link)
        })
    };

    // 在安置延时内发起拆除，必须等启动完成后接手清理
    ready_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(5));
    controller.stop_connection();
    starter.join().unwrap();

    assert!(!controller.is_valid_or_validating());
    // 拆除后既没有看门狗误报，也没有连接丢失误报
    thread::sleep(Duration::from_millis(400));
    assert!(!messages.lock().iter().any(|m| m == "Connection timed out"));
    assert!(!messages.lock().iter().any(|m| m == "Connection lost"));
}

#[test]
fn test_debug_mode_echoes_traffic() {
    let fixture = connect(true);
    assert!(wait_until(WAIT_LIMIT, || {
        fixture.message_received("[DEBUG] Sending command: \"stepper_control\"")
    }));
    fixture.handle.push_line("[v]1");
    assert!(wait_until(WAIT_LIMIT, || {
        fixture.message_received("[DEBUG] Received value: 1")
    }));
    assert!(fixture.controller.is_valid());
}
