//! 集成测试共用的会话构建与等待工具

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spot_robot::mock::MockRobot;
use spot_session::{Session, SessionBuilder, SessionConfig, Target};

/// 关闭探测与视频、缩短超时的测试配置
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.robot.probe_reachability = false;
    config.video.enabled = false;
    config.defaults.tick_interval_ms = 1;
    config.authority.power_timeout_secs = 0.2;
    config.authority.power_poll_interval_ms = 1;
    config
}

pub fn session_with(robot: &MockRobot, config: SessionConfig) -> Arc<Session> {
    SessionBuilder::new(Arc::new(robot.clone()))
        .config(config)
        .build()
}

pub fn session(robot: &MockRobot) -> Arc<Session> {
    session_with(robot, test_config())
}

/// 轮询直到条件成立或超时
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// 启动主循环并等待进入 Running
pub fn start_running(session: &Arc<Session>) {
    session.start(Target::Log).unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || session.is_running()),
        "session never reached Running"
    );
}
