//! Mock 机器人（仅在 `mock` feature 下可用）
//!
//! 内存中的可编程机器人，用于集成测试：
//!
//! - 记录每一次有副作用的 SDK 调用（按顺序），可断言调用次数与先后
//! - 按调用名注入失败（`fail_on("lease.acquire", SdkErrorKind::ResourceAlreadyClaimed)`）
//! - 按命令内容注入失败（`fail_commands_where(...)`）
//! - 按调用名注入延迟（`set_latency("lease.acquire", ...)`，延迟期间不持有内部锁）
//! - 模拟上电、急停、租约占用等机器人侧状态
//!
//! 状态查询（`is_powered_on`、`is_estopped`、`robot_state`、取图）会被主循环
//! 高频调用，不写入调用日志，但仍然遵循失败注入。
//!
//! # 调用名
//!
//! `connect`、`power_on`、`power_off`、`lease.acquire`、`lease.return`、
//! `lease.keep_alive`、`lease.keep_alive.shutdown`、`estop.create_endpoint`、
//! `estop.force_simple_setup`、`estop.keep_alive`、`estop.settle_then_cut`、
//! `estop.allow`、`estop.shutdown`、`time_sync.start`、`time_sync.stop`、`command`

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::{
    CommandService, Credentials, EstopEndpoint, EstopKeepAlive, EstopService, ImageResponse,
    ImageService, Lease, LeaseKeepAlive, LeaseService, RobotCommand, RobotConnection, RobotSdk,
    RobotState, SdkError, SdkErrorKind, TimeSyncHandle, TimeSyncService,
};

type CommandPredicate = Box<dyn Fn(&RobotCommand) -> bool + Send + Sync>;

/// 伪 JPEG 数据（SOI + EOI）
const FAKE_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

struct MockState {
    reachable: bool,
    credentials: Option<Credentials>,
    powered_on: bool,
    estopped: bool,
    /// `power_on` 是否真正生效
    power_on_takes_effect: bool,
    lease_claimed_elsewhere: bool,
    active_lease: Option<Lease>,
    lease_sequence: u64,
    lease_keep_alive_running: bool,
    estop_keep_alive_running: bool,
    time_sync_running: bool,
    state: RobotState,
    failures: HashMap<&'static str, SdkErrorKind>,
    latencies: HashMap<&'static str, Duration>,
    command_failure: Option<CommandPredicate>,
    calls: Vec<&'static str>,
    commands: Vec<(RobotCommand, Option<SystemTime>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            reachable: true,
            credentials: None,
            powered_on: false,
            estopped: false,
            power_on_takes_effect: true,
            lease_claimed_elsewhere: false,
            active_lease: None,
            lease_sequence: 0,
            lease_keep_alive_running: false,
            estop_keep_alive_running: false,
            time_sync_running: false,
            state: RobotState {
                battery_percentage: 87.0,
                estimated_runtime: Duration::from_secs(3600),
            },
            failures: HashMap::new(),
            latencies: HashMap::new(),
            command_failure: None,
            calls: Vec::new(),
            commands: Vec::new(),
        }
    }
}

impl MockState {
    fn injected(&self, call: &'static str) -> Result<(), SdkError> {
        match self.failures.get(call) {
            Some(kind) => Err(SdkError::new(*kind, format!("injected failure in {}", call))),
            None => Ok(()),
        }
    }

    /// 记录调用并检查失败注入
    fn record(&mut self, call: &'static str) -> Result<(), SdkError> {
        self.calls.push(call);
        self.injected(call)
    }
}

/// 可编程的 Mock 机器人
///
/// `Clone` 共享同一份内部状态：测试持有一个副本用于断言，
/// 另一个副本作为 [`RobotSdk`] 注入会话。
#[derive(Clone, Default)]
pub struct MockRobot {
    state: Arc<Mutex<MockState>>,
}

impl MockRobot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置网络是否可达（不可达时 `connect` 返回 `UnableToConnect`）
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// 要求 `connect` 使用指定凭据，否则返回 `Unauthenticated`
    pub fn require_credentials(&self, credentials: Credentials) {
        self.state.lock().credentials = Some(credentials);
    }

    /// 直接修改上电状态（模拟意外掉电等）
    pub fn set_powered_on(&self, powered_on: bool) {
        self.state.lock().powered_on = powered_on;
    }

    pub fn set_estopped(&self, estopped: bool) {
        let mut state = self.state.lock();
        state.estopped = estopped;
        if estopped {
            state.powered_on = false;
        }
    }

    /// 为 false 时 `power_on` 返回成功但机器人保持断电
    pub fn set_power_on_takes_effect(&self, takes_effect: bool) {
        self.state.lock().power_on_takes_effect = takes_effect;
    }

    /// 模拟租约被其他设备持有
    pub fn set_lease_claimed_elsewhere(&self, claimed: bool) {
        self.state.lock().lease_claimed_elsewhere = claimed;
    }

    pub fn set_robot_state(&self, robot_state: RobotState) {
        self.state.lock().state = robot_state;
    }

    /// 让指定调用持续失败，直到 [`clear_failure`](Self::clear_failure)
    pub fn fail_on(&self, call: &'static str, kind: SdkErrorKind) {
        self.state.lock().failures.insert(call, kind);
    }

    pub fn clear_failure(&self, call: &'static str) {
        self.state.lock().failures.remove(call);
    }

    /// 指定调用在返回前阻塞 `latency`（目前支持 `lease.acquire`）
    pub fn set_latency(&self, call: &'static str, latency: Duration) {
        self.state.lock().latencies.insert(call, latency);
    }

    /// 满足条件的运动命令返回 `Rpc` 错误
    pub fn fail_commands_where<F>(&self, predicate: F)
    where
        F: Fn(&RobotCommand) -> bool + Send + Sync + 'static,
    {
        self.state.lock().command_failure = Some(Box::new(predicate));
    }

    /// 按顺序返回全部有副作用的调用
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// 调用第一次出现的位置
    pub fn first_call_index(&self, call: &str) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| *c == call)
    }

    /// 已接受的运动命令（不含被拒绝的）
    pub fn commands(&self) -> Vec<RobotCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    pub fn is_powered_on(&self) -> bool {
        self.state.lock().powered_on
    }

    pub fn is_estopped(&self) -> bool {
        self.state.lock().estopped
    }

    pub fn active_lease(&self) -> Option<Lease> {
        self.state.lock().active_lease.clone()
    }

    pub fn lease_keep_alive_running(&self) -> bool {
        self.state.lock().lease_keep_alive_running
    }

    pub fn estop_keep_alive_running(&self) -> bool {
        self.state.lock().estop_keep_alive_running
    }

    pub fn time_sync_running(&self) -> bool {
        self.state.lock().time_sync_running
    }

    fn service(&self) -> Arc<MockService> {
        Arc::new(MockService {
            state: Arc::clone(&self.state),
        })
    }
}

impl RobotSdk for MockRobot {
    fn connect(
        &self,
        _address: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RobotConnection>, SdkError> {
        let mut state = self.state.lock();
        state.record("connect")?;
        if !state.reachable {
            return Err(SdkError::new(
                SdkErrorKind::UnableToConnect,
                "robot is unreachable",
            ));
        }
        if let Some(expected) = &state.credentials
            && expected != credentials
        {
            return Err(SdkError::new(
                SdkErrorKind::Unauthenticated,
                "invalid username or password",
            ));
        }
        drop(state);
        Ok(self.service())
    }
}

/// 共享 Mock 状态的服务句柄（同时实现全部服务 trait）
struct MockService {
    state: Arc<Mutex<MockState>>,
}

impl MockService {
    fn handle(&self) -> Box<MockHandle> {
        Box::new(MockHandle {
            state: Arc::clone(&self.state),
        })
    }
}

impl RobotConnection for MockService {
    fn is_powered_on(&self) -> Result<bool, SdkError> {
        let state = self.state.lock();
        state.injected("is_powered_on")?;
        Ok(state.powered_on)
    }

    fn is_estopped(&self) -> Result<bool, SdkError> {
        let state = self.state.lock();
        state.injected("is_estopped")?;
        Ok(state.estopped)
    }

    fn power_on(&self, _timeout: Duration) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("power_on")?;
        if state.estopped {
            return Err(SdkError::new(SdkErrorKind::Estopped, "robot is estopped"));
        }
        if state.power_on_takes_effect {
            state.powered_on = true;
        }
        Ok(())
    }

    fn power_off(&self, _cut_immediately: bool, _timeout: Duration) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("power_off")?;
        state.powered_on = false;
        Ok(())
    }

    fn robot_state(&self) -> Result<RobotState, SdkError> {
        let state = self.state.lock();
        state.injected("robot_state")?;
        Ok(state.state)
    }

    fn lease_service(&self) -> Result<Arc<dyn LeaseService>, SdkError> {
        Ok(self.clone_service())
    }

    fn estop_service(&self) -> Result<Arc<dyn EstopService>, SdkError> {
        Ok(self.clone_service())
    }

    fn time_sync_service(&self) -> Result<Arc<dyn TimeSyncService>, SdkError> {
        Ok(self.clone_service())
    }

    fn command_service(&self) -> Result<Arc<dyn CommandService>, SdkError> {
        Ok(self.clone_service())
    }

    fn image_service(&self) -> Result<Arc<dyn ImageService>, SdkError> {
        Ok(self.clone_service())
    }
}

impl MockService {
    fn clone_service(&self) -> Arc<MockService> {
        Arc::new(MockService {
            state: Arc::clone(&self.state),
        })
    }
}

impl LeaseService for MockService {
    fn acquire(&self) -> Result<Lease, SdkError> {
        let latency = self.state.lock().latencies.get("lease.acquire").copied();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let mut state = self.state.lock();
        state.record("lease.acquire")?;
        if state.lease_claimed_elsewhere {
            return Err(SdkError::new(
                SdkErrorKind::ResourceAlreadyClaimed,
                "body lease is held by another client",
            ));
        }
        state.lease_sequence += 1;
        let lease = Lease {
            resource: "body".to_string(),
            epoch: "mock".to_string(),
            sequence: state.lease_sequence,
        };
        state.active_lease = Some(lease.clone());
        Ok(lease)
    }

    fn return_lease(&self, lease: &Lease) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("lease.return")?;
        if state.active_lease.as_ref() != Some(lease) {
            return Err(SdkError::new(
                SdkErrorKind::NotActiveLease,
                format!("lease {} is not active", lease.sequence),
            ));
        }
        state.active_lease = None;
        Ok(())
    }

    fn keep_alive(&self, _lease: &Lease) -> Result<Box<dyn LeaseKeepAlive>, SdkError> {
        let mut state = self.state.lock();
        state.record("lease.keep_alive")?;
        state.lease_keep_alive_running = true;
        Ok(self.handle())
    }
}

impl EstopService for MockService {
    fn create_endpoint(
        &self,
        _name: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn EstopEndpoint>, SdkError> {
        self.state.lock().record("estop.create_endpoint")?;
        Ok(self.handle())
    }
}

impl TimeSyncService for MockService {
    fn start(&self) -> Result<Box<dyn TimeSyncHandle>, SdkError> {
        let mut state = self.state.lock();
        state.record("time_sync.start")?;
        state.time_sync_running = true;
        Ok(self.handle())
    }
}

impl CommandService for MockService {
    fn robot_command(
        &self,
        command: &RobotCommand,
        end_time: Option<SystemTime>,
    ) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("command")?;
        if state.active_lease.is_none() {
            return Err(SdkError::new(
                SdkErrorKind::NoSuchLease,
                "no lease held for body",
            ));
        }
        if state.estopped {
            return Err(SdkError::new(SdkErrorKind::Estopped, "robot is estopped"));
        }
        if let Some(predicate) = &state.command_failure
            && predicate(command)
        {
            return Err(SdkError::new(
                SdkErrorKind::Rpc,
                format!("injected failure for {}", command.name()),
            ));
        }
        state.commands.push((command.clone(), end_time));
        Ok(())
    }
}

impl ImageService for MockService {
    fn get_image_from_sources(&self, sources: &[&str]) -> Result<Vec<ImageResponse>, SdkError> {
        self.state.lock().injected("image")?;
        Ok(sources
            .iter()
            .map(|source| ImageResponse {
                source: source.to_string(),
                rows: 480,
                cols: 640,
                data: FAKE_JPEG.to_vec(),
            })
            .collect())
    }
}

/// 急停端点 / 续约句柄 / 时间同步句柄
struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl EstopEndpoint for MockHandle {
    fn force_simple_setup(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("estop.force_simple_setup")?;
        if state.powered_on {
            return Err(SdkError::new(
                SdkErrorKind::MotorsOn,
                "cannot replace estop configuration while motors are on",
            ));
        }
        Ok(())
    }

    fn start_keep_alive(self: Box<Self>) -> Result<Box<dyn EstopKeepAlive>, SdkError> {
        let mut state = self.state.lock();
        state.record("estop.keep_alive")?;
        state.estop_keep_alive_running = true;
        drop(state);
        Ok(self)
    }
}

impl EstopKeepAlive for MockHandle {
    fn settle_then_cut(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("estop.settle_then_cut")?;
        state.estopped = true;
        state.powered_on = false;
        Ok(())
    }

    fn allow(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("estop.allow")?;
        state.estopped = false;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("estop.shutdown")?;
        state.estop_keep_alive_running = false;
        Ok(())
    }
}

impl LeaseKeepAlive for MockHandle {
    fn shutdown(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("lease.keep_alive.shutdown")?;
        state.lease_keep_alive_running = false;
        Ok(())
    }
}

impl TimeSyncHandle for MockHandle {
    fn stop(&mut self) -> Result<(), SdkError> {
        let mut state = self.state.lock();
        state.record("time_sync.stop")?;
        state.time_sync_running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(robot: &MockRobot) -> Arc<dyn RobotConnection> {
        robot
            .connect("192.168.80.3", &Credentials::default())
            .unwrap()
    }

    #[test]
    fn test_unreachable_robot() {
        let robot = MockRobot::new();
        robot.set_reachable(false);
        let err = robot
            .connect("192.168.80.3", &Credentials::default())
            .err()
            .unwrap();
        assert!(err.is(SdkErrorKind::UnableToConnect));
        assert_eq!(robot.call_count("connect"), 1);
    }

    #[test]
    fn test_credentials_checked() {
        let robot = MockRobot::new();
        robot.require_credentials(Credentials {
            username: "user".to_string(),
            password: "pw".to_string(),
        });
        let err = robot
            .connect("192.168.80.3", &Credentials::default())
            .err()
            .unwrap();
        assert!(err.is(SdkErrorKind::Unauthenticated));
    }

    #[test]
    fn test_estop_cut_powers_off() {
        let robot = MockRobot::new();
        let conn = connect(&robot);
        let estop = conn.estop_service().unwrap();
        let mut endpoint = estop
            .create_endpoint("cc-estop", Duration::from_secs(20))
            .unwrap();
        endpoint.force_simple_setup().unwrap();
        let mut keep_alive = endpoint.start_keep_alive().unwrap();

        conn.power_on(Duration::from_secs(20)).unwrap();
        assert!(robot.is_powered_on());

        keep_alive.settle_then_cut().unwrap();
        assert!(robot.is_estopped());
        assert!(!robot.is_powered_on());

        // 急停状态下无法上电
        let err = conn.power_on(Duration::from_secs(20)).unwrap_err();
        assert!(err.is(SdkErrorKind::Estopped));

        keep_alive.allow().unwrap();
        keep_alive.shutdown().unwrap();
        assert!(!robot.is_estopped());
        assert!(!robot.estop_keep_alive_running());
    }

    #[test]
    fn test_lease_lifecycle() {
        let robot = MockRobot::new();
        let conn = connect(&robot);
        let leases = conn.lease_service().unwrap();

        let lease = leases.acquire().unwrap();
        let mut keep_alive = leases.keep_alive(&lease).unwrap();
        assert!(robot.lease_keep_alive_running());
        assert_eq!(robot.active_lease(), Some(lease.clone()));

        keep_alive.shutdown().unwrap();
        leases.return_lease(&lease).unwrap();
        assert!(robot.active_lease().is_none());

        // 重复归还
        let err = leases.return_lease(&lease).unwrap_err();
        assert!(err.is(SdkErrorKind::NotActiveLease));
    }

    #[test]
    fn test_lease_claimed_elsewhere() {
        let robot = MockRobot::new();
        robot.set_lease_claimed_elsewhere(true);
        let conn = connect(&robot);
        let err = conn.lease_service().unwrap().acquire().unwrap_err();
        assert!(err.is(SdkErrorKind::ResourceAlreadyClaimed));
    }

    #[test]
    fn test_failure_injection_and_call_log() {
        let robot = MockRobot::new();
        robot.fail_on("time_sync.start", SdkErrorKind::TimedOut);
        let conn = connect(&robot);
        let err = conn.time_sync_service().unwrap().start().err().unwrap();
        assert!(err.is(SdkErrorKind::TimedOut));

        robot.clear_failure("time_sync.start");
        let mut handle = conn.time_sync_service().unwrap().start().unwrap();
        assert!(robot.time_sync_running());
        handle.stop().unwrap();

        assert_eq!(
            robot.calls(),
            vec![
                "connect",
                "time_sync.start",
                "time_sync.start",
                "time_sync.stop"
            ]
        );
        assert_eq!(robot.first_call_index("time_sync.stop"), Some(3));
    }

    #[test]
    fn test_commands_require_lease() {
        let robot = MockRobot::new();
        let conn = connect(&robot);
        let commands = conn.command_service().unwrap();

        let err = commands.robot_command(&RobotCommand::sit(), None).unwrap_err();
        assert!(err.is(SdkErrorKind::NoSuchLease));

        conn.lease_service().unwrap().acquire().unwrap();
        robot.fail_commands_where(|cmd| matches!(cmd, RobotCommand::SelfRight));
        commands.robot_command(&RobotCommand::sit(), None).unwrap();
        assert!(
            commands
                .robot_command(&RobotCommand::self_right(), None)
                .is_err()
        );
        assert_eq!(robot.commands(), vec![RobotCommand::sit()]);
    }

    #[test]
    fn test_images_per_source() {
        let robot = MockRobot::new();
        let conn = connect(&robot);
        let images = conn
            .image_service()
            .unwrap()
            .get_image_from_sources(&["a", "b"])
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].source, "b");
    }
}
