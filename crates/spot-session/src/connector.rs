//! 机器人连接的建立与拆除
//!
//! 连接顺序：可达性探测 → 认证 → 时间同步 → 图像/命令服务 → 视频推送 → 运动外观。
//! 任何一步失败都会完整断开（回滚已建立的部分）。

use std::process::{Command as Process, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use spot_protocol::NotificationKind;
use spot_robot::{Credentials, RobotConnection, SdkError, TimeSyncHandle};
use tracing::{debug, info, warn};

use crate::Session;
use crate::control::{MotionControl, SpotControl};
use crate::error::{SessionError, report};
use crate::notify::Target;
use crate::power;
use crate::video::VideoStreamer;

/// 连接前的可达性探测
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, address: &str) -> bool;
}

/// 基于 `ping` 的探测
///
/// ping 需要原始套接字权限，非 root 进程直接视为可达。
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProbe;

impl PingProbe {
    #[cfg(unix)]
    fn privileged() -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    fn privileged() -> bool {
        false
    }
}

impl ReachabilityProbe for PingProbe {
    fn is_reachable(&self, address: &str) -> bool {
        if !Self::privileged() {
            debug!("Skipping reachability probe (not running as root)");
            return true;
        }
        match Process::new("ping")
            .args(["-c", "1", "-W", "1", address])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("Failed to run ping: {}", e);
                true
            },
        }
    }
}

/// 总是可达（测试 / 关闭探测时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

impl ReachabilityProbe for AlwaysReachable {
    fn is_reachable(&self, _address: &str) -> bool {
        true
    }
}

/// 已建立的机器人连接及其附属资源
pub struct RobotLink {
    connection: Arc<dyn RobotConnection>,
    control: Arc<dyn MotionControl>,
    time_sync: Mutex<Option<Box<dyn TimeSyncHandle>>>,
    video: Mutex<Option<VideoStreamer>>,
}

impl RobotLink {
    pub fn connection(&self) -> &dyn RobotConnection {
        self.connection.as_ref()
    }

    pub fn control(&self) -> &dyn MotionControl {
        self.control.as_ref()
    }

    pub fn has_time_sync(&self) -> bool {
        self.time_sync.lock().is_some()
    }

    fn stop_time_sync(&self) {
        if let Some(mut handle) = self.time_sync.lock().take()
            && let Err(e) = handle.stop()
        {
            warn!("Failed to stop time sync: {}", e);
        }
    }

    fn stop_video(&self) {
        if let Some(video) = self.video.lock().take() {
            video.stop();
        }
    }
}

impl Session {
    /// 建立机器人连接
    ///
    /// 已连接时直接返回成功。
    pub fn connect(&self, requester: Target) -> bool {
        if self.link.load().is_some() {
            self.bus.info(requester, "Robot is already connected");
            return true;
        }

        self.bus.info(requester, "Connecting to robot...");
        let address = &self.config.robot.address;
        if self.config.robot.probe_reachability && !self.probe.is_reachable(address) {
            self.bus.error(
                requester,
                "Robot is not at the specified address! Is it on the wifi?",
            );
            return false;
        }

        match self.establish(requester) {
            Ok(link) => {
                self.link.store(Some(Arc::new(link)));
                info!("Connected to robot at {}", address);
                self.bus
                    .event(Target::Broadcast, NotificationKind::RobotToggle, "acquire");
                self.bus.success(requester, "Connected to robot");
                true
            },
            Err(e) => {
                report(&self.bus, requester, &e);
                self.bus.error(requester, "Failed to connect to Spot");
                self.disconnect();
                false
            },
        }
    }

    fn establish(&self, requester: Target) -> Result<RobotLink, SessionError> {
        let credentials = Credentials {
            username: self.config.robot.username.clone(),
            password: self.config.robot.password.clone(),
        };
        let connection = self
            .sdk
            .connect(&self.config.robot.address, &credentials)
            .map_err(SessionError::connection("authenticate"))?;

        let mut time_sync = match Self::start_time_sync(connection.as_ref()) {
            Ok(handle) => handle,
            Err(e) => {
                self.bus.error(requester, "Failed to acquire Time Sync");
                return Err(SessionError::connection("time_sync")(e));
            },
        };

        let services = connection
            .image_service()
            .and_then(|images| Ok((images, connection.command_service()?)));
        let (images, commands) = match services {
            Ok(services) => services,
            Err(e) => {
                if let Err(stop_err) = time_sync.stop() {
                    warn!("Failed to stop time sync during rollback: {}", stop_err);
                }
                return Err(SessionError::connection("clients")(e));
            },
        };

        let video = if self.config.video.enabled {
            match VideoStreamer::start(
                Arc::clone(&connection),
                images,
                Arc::clone(&self.stitcher),
                Arc::clone(&self.bus),
                self.config.video.clone(),
            ) {
                Ok(video) => Some(video),
                Err(e) => {
                    if let Err(stop_err) = time_sync.stop() {
                        warn!("Failed to stop time sync during rollback: {}", stop_err);
                    }
                    return Err(e.into());
                },
            }
        } else {
            None
        };

        let control: Arc<dyn MotionControl> = Arc::new(SpotControl::new(
            commands,
            Arc::clone(&self.bus),
            self.config.keyboard,
        ));

        Ok(RobotLink {
            connection,
            control,
            time_sync: Mutex::new(Some(time_sync)),
            video: Mutex::new(video),
        })
    }

    fn start_time_sync(robot: &dyn RobotConnection) -> Result<Box<dyn TimeSyncHandle>, SdkError> {
        robot.time_sync_service()?.start()
    }

    /// 重新获取时间同步（已持有时无操作）
    pub fn acquire_time_sync(&self, requester: Target) -> bool {
        let Some(link) = self.link.load_full() else {
            return self.not_connected(requester);
        };
        let mut time_sync = link.time_sync.lock();
        if time_sync.is_some() {
            return true;
        }
        match Self::start_time_sync(link.connection()) {
            Ok(handle) => {
                *time_sync = Some(handle);
                true
            },
            Err(e) => {
                report(&self.bus, requester, &SessionError::connection("time_sync")(e));
                self.bus.error(requester, "Failed to acquire Time Sync");
                false
            },
        }
    }

    pub fn clear_time_sync(&self) {
        if let Some(link) = self.link.load_full() {
            link.stop_time_sync();
        }
    }

    /// 按顺序连接、获取急停、获取租约，遇到第一个失败即停止
    pub fn connect_all(&self, requester: Target) -> bool {
        self.bus.info(requester, "Starting...");
        self.connect(requester) && self.acquire_estop(requester) && self.acquire_lease(requester)
    }

    /// 断开连接并释放全部权限（可重复调用）
    pub fn disconnect(&self) {
        let link = self.link.load_full();
        let connection = link.as_ref().map(|link| link.connection());

        if self.authority.has_lease() || self.authority.has_estop() {
            self.authority.clear_estop(connection);
        }
        if let Some(link) = &link {
            link.stop_time_sync();
            link.stop_video();
        }
        self.link.store(None);

        if link.is_some() {
            info!("Disconnected from robot");
        }
        self.bus
            .event(Target::Broadcast, NotificationKind::RobotToggle, "clear");
    }

    fn not_connected(&self, requester: Target) -> bool {
        report(&self.bus, requester, &SessionError::NotConnected);
        false
    }

    pub fn acquire_estop(&self, requester: Target) -> bool {
        match self.link.load_full() {
            Some(link) => self
                .authority
                .acquire_estop(link.connection(), requester)
                .is_ok(),
            None => self.not_connected(requester),
        }
    }

    pub fn acquire_lease(&self, requester: Target) -> bool {
        match self.link.load_full() {
            Some(link) => self
                .authority
                .acquire_lease(link.connection(), requester)
                .is_ok(),
            None => self.not_connected(requester),
        }
    }

    pub fn clear_lease(&self) {
        let link = self.link.load_full();
        self.authority
            .clear_lease(link.as_ref().map(|link| link.connection()));
    }

    pub fn clear_estop(&self) {
        let link = self.link.load_full();
        self.authority
            .clear_estop(link.as_ref().map(|link| link.connection()));
    }

    pub fn turn_on(&self, requester: Target) -> bool {
        match self.link.load_full() {
            Some(link) => power::turn_on(
                link.connection(),
                self.config.authority.power_timeout(),
                &self.bus,
                requester,
            ),
            None => self.not_connected(requester),
        }
    }

    pub fn turn_off(&self, requester: Target) -> bool {
        match self.link.load_full() {
            Some(link) => power::turn_off(
                link.connection(),
                self.config.authority.power_timeout(),
                self.config.authority.power_poll_interval(),
                &self.bus,
                requester,
            ),
            None => self.not_connected(requester),
        }
    }
}
