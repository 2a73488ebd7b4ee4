//! 急停与租约权限管理
//!
//! # 不变量
//!
//! - 租约依赖急停：未持有急停时 `acquire_lease` 直接拒绝，不会访问租约服务
//! - 释放急停前先释放租约（`clear_estop` 级联 `clear_lease`）
//! - 获取失败时回滚已经获得的部分资源，清理过程吞掉远端错误，保证本地状态干净
//! - 急停与租约各占一把锁，租约的远端调用不持有任何锁，急停切断不会被租约请求拖住
//!
//! 所有远端错误都在本模块内记录并通知请求方，调用方只需要看返回值。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use spot_protocol::NotificationKind;
use spot_robot::{
    EstopKeepAlive, Lease, LeaseKeepAlive, LeaseService, RobotConnection, SdkError,
};
use tracing::{debug, info, warn};

use crate::config::AuthorityConfig;
use crate::error::{SessionError, report};
use crate::notify::{NotificationBus, Target};
use crate::power;

/// 获取结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// 本次调用新获得
    Granted,
    /// 已经持有，未访问机器人
    AlreadyHeld,
}

/// 持有中的租约及其续约句柄
struct LeaseHold {
    service: Arc<dyn LeaseService>,
    lease: Lease,
    keep_alive: Box<dyn LeaseKeepAlive>,
}

impl LeaseHold {
    /// 归还租约并停止续约（远端错误只记录日志）
    fn release(mut self) {
        if let Err(e) = self.service.return_lease(&self.lease) {
            warn!("Failed to return lease: {}", e);
        }
        if let Err(e) = self.keep_alive.shutdown() {
            warn!("Failed to shut down lease keep-alive: {}", e);
        }
    }
}

/// 进行中的租约请求标记，离开作用域时复位
struct LeasePending<'a>(&'a AtomicBool);

impl<'a> LeasePending<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for LeasePending<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 急停 / 租约权限管理器
pub struct AuthorityManager {
    config: AuthorityConfig,
    bus: Arc<NotificationBus>,
    estop: Mutex<Option<Box<dyn EstopKeepAlive>>>,
    lease: Mutex<Option<LeaseHold>>,
    lease_pending: AtomicBool,
    has_estop: AtomicBool,
    has_lease: AtomicBool,
    /// 由本端急停切断（尚未解除）
    robot_estopped: AtomicBool,
}

impl AuthorityManager {
    pub fn new(config: AuthorityConfig, bus: Arc<NotificationBus>) -> Self {
        Self {
            config,
            bus,
            estop: Mutex::new(None),
            lease: Mutex::new(None),
            lease_pending: AtomicBool::new(false),
            has_estop: AtomicBool::new(false),
            has_lease: AtomicBool::new(false),
            robot_estopped: AtomicBool::new(false),
        }
    }

    pub fn has_estop(&self) -> bool {
        self.has_estop.load(Ordering::Acquire)
    }

    pub fn has_lease(&self) -> bool {
        self.has_lease.load(Ordering::Acquire)
    }

    pub fn robot_estopped(&self) -> bool {
        self.robot_estopped.load(Ordering::Acquire)
    }

    /// 获取急停权限
    ///
    /// 失败时已完成回滚并通知 `requester`。
    pub fn acquire_estop(
        &self,
        robot: &dyn RobotConnection,
        requester: Target,
    ) -> Result<Acquired, SessionError> {
        let result = {
            let mut estop = self.estop.lock();
            if estop.is_some() {
                self.bus.info(requester, "Estop already acquired");
                return Ok(Acquired::AlreadyHeld);
            }

            self.bus.info(requester, "Acquiring Estop...");
            match self.open_estop(robot) {
                Ok(keep_alive) => {
                    *estop = Some(keep_alive);
                    self.has_estop.store(true, Ordering::Release);
                    self.robot_estopped.store(false, Ordering::Release);
                    Ok(())
                },
                Err(e) => Err(SessionError::authority("acquire_estop")(e)),
            }
        };

        match result {
            Ok(()) => {
                info!("Estop acquired");
                self.bus.success(requester, "Acquired Estop");
                self.bus
                    .event(Target::Broadcast, NotificationKind::EstopToggle, "acquire");
                Ok(Acquired::Granted)
            },
            Err(err) => {
                report(&self.bus, requester, &err);
                self.bus.error(requester, "Failed to acquire Estop");
                self.clear_estop(Some(robot));
                Err(err)
            },
        }
    }

    fn open_estop(&self, robot: &dyn RobotConnection) -> Result<Box<dyn EstopKeepAlive>, SdkError> {
        let service = robot.estop_service()?;
        let mut endpoint =
            service.create_endpoint(&self.config.estop_name, self.config.estop_timeout())?;
        endpoint.force_simple_setup()?;
        endpoint.start_keep_alive()
    }

    /// 获取租约
    ///
    /// 前置条件：已持有急停，且机器人当前不处于急停状态。
    pub fn acquire_lease(
        &self,
        robot: &dyn RobotConnection,
        requester: Target,
    ) -> Result<Acquired, SessionError> {
        if !self.has_estop() {
            let err =
                SessionError::rejected("Cannot acquire lease because Estop has not been acquired!");
            report(&self.bus, requester, &err);
            return Err(err);
        }

        let Some(_pending) = LeasePending::try_acquire(&self.lease_pending) else {
            let err = SessionError::rejected("Lease acquisition is already in progress");
            report(&self.bus, requester, &err);
            return Err(err);
        };
        if self.lease.lock().is_some() {
            self.bus.info(requester, "Lease already acquired");
            return Ok(Acquired::AlreadyHeld);
        }

        match robot.is_estopped() {
            Ok(false) => {},
            Ok(true) => {
                let err = SessionError::rejected("Robot is estopped. Cannot acquire lease.");
                report(&self.bus, requester, &err);
                return Err(err);
            },
            Err(e) => {
                let err = SessionError::authority("acquire_lease")(e);
                report(&self.bus, requester, &err);
                return Err(err);
            },
        }

        self.bus.info(requester, "Acquiring Lease...");
        let result = Self::open_lease(robot)
            .map_err(SessionError::authority("acquire_lease"))
            .and_then(|hold| self.install_lease(hold));

        match result {
            Ok(()) => {
                info!("Lease acquired");
                self.bus.success(requester, "Acquired Lease");
                self.bus
                    .event(Target::Broadcast, NotificationKind::LeaseToggle, "acquire");
                Ok(Acquired::Granted)
            },
            Err(err) => {
                report(&self.bus, requester, &err);
                self.bus.error(requester, "Failed to acquire lease");
                self.clear_lease(Some(robot));
                Err(err)
            },
        }
    }

    /// 远端获取完成后登记租约
    ///
    /// 获取期间急停已被释放时立即归还，租约不能脱离急停存在。
    fn install_lease(&self, hold: LeaseHold) -> Result<(), SessionError> {
        let mut slot = self.lease.lock();
        if !self.has_estop() {
            drop(slot);
            hold.release();
            return Err(SessionError::rejected(
                "Cannot acquire lease because Estop has not been acquired!",
            ));
        }
        debug!("Lease acquired: {:?}", hold.lease);
        *slot = Some(hold);
        self.has_lease.store(true, Ordering::Release);
        Ok(())
    }

    fn open_lease(robot: &dyn RobotConnection) -> Result<LeaseHold, SdkError> {
        let service = robot.lease_service()?;
        let lease = service.acquire()?;
        let keep_alive = match service.keep_alive(&lease) {
            Ok(keep_alive) => keep_alive,
            Err(e) => {
                if let Err(return_err) = service.return_lease(&lease) {
                    warn!("Failed to return lease after keep-alive failure: {}", return_err);
                }
                return Err(e);
            },
        };
        Ok(LeaseHold {
            service,
            lease,
            keep_alive,
        })
    }

    /// 触发急停（平缓停止后断电）
    ///
    /// 返回机器人此刻是否处于本端急停状态。
    pub fn estop(&self) -> bool {
        let mut estop = self.estop.lock();
        let Some(keep_alive) = estop.as_mut() else {
            self.bus.warning(Target::Broadcast, "Estop Not Acquired");
            return false;
        };
        if self.robot_estopped() {
            return true;
        }

        match keep_alive.settle_then_cut() {
            Ok(()) => {
                warn!("Estop triggered");
                self.robot_estopped.store(true, Ordering::Release);
                self.bus
                    .event(Target::Broadcast, NotificationKind::Estop, "estop");
                true
            },
            Err(e) => {
                report(
                    &self.bus,
                    Target::Broadcast,
                    &SessionError::authority("estop")(e),
                );
                false
            },
        }
    }

    /// 解除急停（仅在已由本端急停时生效）
    pub fn release_estop(&self) -> bool {
        let mut estop = self.estop.lock();
        let Some(keep_alive) = estop.as_mut() else {
            self.bus.warning(Target::Broadcast, "Estop Not Acquired");
            return false;
        };
        if !self.robot_estopped() {
            return false;
        }

        match keep_alive.allow() {
            Ok(()) => {
                info!("Estop released");
                self.robot_estopped.store(false, Ordering::Release);
                self.bus
                    .event(Target::Broadcast, NotificationKind::Estop, "estop_release");
                true
            },
            Err(e) => {
                report(
                    &self.bus,
                    Target::Broadcast,
                    &SessionError::authority("estop_release")(e),
                );
                false
            },
        }
    }

    /// 在触发与解除之间切换，返回切换后的急停状态
    pub fn toggle(&self) -> bool {
        if self.robot_estopped() {
            self.release_estop();
        } else {
            self.estop();
        }
        self.robot_estopped()
    }

    /// 释放租约
    ///
    /// 机器人仍上电时先平缓断电并等待确认（以电源超时为上限），
    /// 然后归还租约并停止续约。远端错误只记录日志。
    pub fn clear_lease(&self, robot: Option<&dyn RobotConnection>) {
        let hold = self.lease.lock().take();
        self.has_lease.store(false, Ordering::Release);

        if let Some(hold) = hold {
            if let Some(robot) = robot
                && robot.is_powered_on().unwrap_or(false)
            {
                power::turn_off(
                    robot,
                    self.config.power_timeout(),
                    self.config.power_poll_interval(),
                    &self.bus,
                    Target::Log,
                );
            }
            hold.release();
            info!("Lease cleared");
        }

        self.bus
            .event(Target::Broadcast, NotificationKind::LeaseToggle, "clear");
    }

    /// 释放急停（先级联释放租约）
    pub fn clear_estop(&self, robot: Option<&dyn RobotConnection>) {
        // 先撤下标志，进行中的租约请求登记时会发现并自行归还
        self.has_estop.store(false, Ordering::Release);
        self.clear_lease(robot);

        let keep_alive = self.estop.lock().take();
        if let Some(mut keep_alive) = keep_alive {
            if let Err(e) = keep_alive.settle_then_cut() {
                warn!("Failed to settle estop before shutdown: {}", e);
            }
            if let Err(e) = keep_alive.shutdown() {
                warn!("Failed to shut down estop keep-alive: {}", e);
            }
            info!("Estop cleared");
        }

        self.bus
            .event(Target::Broadcast, NotificationKind::EstopToggle, "clear");
    }

    /// 复位本地标志（会话拆除之后调用）
    pub fn reset(&self) {
        self.robot_estopped.store(false, Ordering::Release);
    }
}
