//! 上电 / 断电
//!
//! 两个操作都会在调用后再次查询 `is_powered_on` 确认结果，
//! SDK 调用成功但状态未变化同样视为失败。

use std::thread;
use std::time::{Duration, Instant};

use spot_robot::RobotConnection;
use tracing::{debug, warn};

use crate::error::{SessionError, report};
use crate::notify::{NotificationBus, Target};

/// 给电机上电并确认
pub fn turn_on(
    robot: &dyn RobotConnection,
    timeout: Duration,
    bus: &NotificationBus,
    target: Target,
) -> bool {
    bus.info(target, "Powering On...");
    let result = robot
        .power_on(timeout)
        .and_then(|()| robot.is_powered_on());
    match result {
        Ok(true) => {
            bus.success(target, "Powered On");
            true
        },
        Ok(false) => {
            warn!("power_on returned but robot reports powered off");
            bus.error(target, "Robot Power On Failed");
            false
        },
        Err(e) => {
            report(bus, target, &SessionError::from(e));
            bus.error(target, "Robot Power On Failed");
            false
        },
    }
}

/// 平缓断电（不立即切断），并在 `timeout` 内轮询确认
pub fn turn_off(
    robot: &dyn RobotConnection,
    timeout: Duration,
    poll: Duration,
    bus: &NotificationBus,
    target: Target,
) -> bool {
    bus.info(target, "Powering off...");
    if let Err(e) = robot.power_off(false, timeout) {
        report(bus, target, &SessionError::from(e));
        bus.error(target, "Robot power off failed");
        return false;
    }
    if wait_until_off(robot, timeout, poll) {
        bus.success(target, "Powered Off");
        true
    } else {
        bus.error(target, "Robot power off failed");
        false
    }
}

/// 轮询直到机器人断电或超时
pub(crate) fn wait_until_off(robot: &dyn RobotConnection, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match robot.is_powered_on() {
            Ok(false) => return true,
            Ok(true) => {},
            Err(e) => debug!("is_powered_on failed while waiting for power off: {}", e),
        }
        if Instant::now() >= deadline {
            warn!("Robot still powered on after {:?}", timeout);
            return false;
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_protocol::Severity;
    use spot_robot::mock::MockRobot;
    use spot_robot::{Credentials, RobotSdk, SdkErrorKind};

    fn setup() -> (MockRobot, std::sync::Arc<dyn RobotConnection>, NotificationBus) {
        let robot = MockRobot::new();
        let conn = robot.connect("mock", &Credentials::default()).unwrap();
        (robot, conn, NotificationBus::default())
    }

    #[test]
    fn test_turn_on_and_off() {
        let (robot, conn, bus) = setup();
        assert!(turn_on(conn.as_ref(), Duration::from_secs(1), &bus, Target::Log));
        assert!(robot.is_powered_on());
        assert!(turn_off(
            conn.as_ref(),
            Duration::from_secs(1),
            Duration::from_millis(1),
            &bus,
            Target::Log
        ));
        assert!(!robot.is_powered_on());
    }

    #[test]
    fn test_turn_on_estopped_fails() {
        let (robot, conn, bus) = setup();
        let (id, rx) = bus.subscribe();
        let _ = rx.try_recv();
        robot.set_estopped(true);

        assert!(!turn_on(conn.as_ref(), Duration::from_secs(1), &bus, Target::Client(id)));
        let texts: Vec<_> = rx.try_iter().filter_map(|n| n.text().map(str::to_string)).collect();
        assert_eq!(texts.first().map(String::as_str), Some("Powering On..."));
        assert!(texts.iter().any(|t| t == "Robot cannot turn on while estopped."));
        assert_eq!(texts.last().map(String::as_str), Some("Robot Power On Failed"));
    }

    #[test]
    fn test_turn_on_without_effect_fails() {
        let (robot, conn, bus) = setup();
        let (id, rx) = bus.subscribe();
        let _ = rx.try_recv();
        robot.set_power_on_takes_effect(false);

        assert!(!turn_on(conn.as_ref(), Duration::from_secs(1), &bus, Target::Client(id)));
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.severity, Some(Severity::Error));
    }

    #[test]
    fn test_turn_off_rpc_failure() {
        let (robot, conn, bus) = setup();
        robot.set_powered_on(true);
        robot.fail_on("power_off", SdkErrorKind::Rpc);
        assert!(!turn_off(
            conn.as_ref(),
            Duration::from_millis(10),
            Duration::from_millis(1),
            &bus,
            Target::Log
        ));
        assert!(robot.is_powered_on());
    }
}
