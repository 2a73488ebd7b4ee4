//! 主循环状态机
//!
//! ```text
//! Idle ──start──▶ Connecting ──connect_all + 上电──▶ Running
//!   ▲                 │                                 │
//!   │              失败/end                       end/致命错误
//!   │                 ▼                                 ▼
//!   └────────────── ShuttingDown ◀──────────────────────┘
//! ```
//!
//! 没有单独的错误状态：所有失败都经由 `ShuttingDown` 回到 `Idle`。
//! 状态迁移使用 CAS，`end` 通过条件变量等待拆除完成。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use spot_protocol::NotificationKind;
use tracing::{debug, error, info, warn};

use crate::Session;
use crate::error::{SessionError, report};
use crate::notify::Target;
use crate::power;

/// 主循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u8)]
pub enum LoopState {
    /// 空闲（初始与终止状态）
    #[default]
    Idle = 0,
    /// 正在连接并获取权限
    Connecting = 1,
    /// 主循环运行中
    Running = 2,
    /// 正在拆除
    ShuttingDown = 3,
}

impl LoopState {
    /// 从 u8 转换，无效值视为 Idle
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Idle,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

/// 主循环状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicLoopState {
    inner: AtomicU8,
}

impl AtomicLoopState {
    pub fn new(state: LoopState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LoopState) {
        self.inner.store(state.as_u8(), Ordering::Release);
    }

    /// 当前值等于 `current` 时设置为 `new` 并返回 true
    pub fn compare_exchange(&self, current: LoopState, new: LoopState) -> bool {
        self.inner
            .compare_exchange(
                current.as_u8(),
                new.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicLoopState {
    fn default() -> Self {
        Self::new(LoopState::Idle)
    }
}

/// `is_connecting` 守卫：持有期间其他连接/获取操作被拒绝
pub(crate) struct ConnectingGuard {
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl ConnectingGuard {
    pub(crate) fn try_acquire(flag: &Arc<std::sync::atomic::AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 主循环线程的退出守卫
///
/// 正常返回和 panic 展开都会经过这里，保证权限被释放、状态回到 Idle。
struct LoopExit<'a> {
    session: &'a Session,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Session loop panicked, tearing down");
        }
        self.session.finish_loop();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl Session {
    pub fn loop_state(&self) -> LoopState {
        self.loop_state.get()
    }

    pub fn is_running(&self) -> bool {
        self.loop_state.get().is_running()
    }

    /// 当前存活的主循环线程数（0 或 1）
    pub fn loop_thread_count(&self) -> usize {
        self.loop_threads.load(Ordering::Acquire)
    }

    /// 启动主循环
    ///
    /// 已在运行或正在连接时拒绝，不会排队。
    pub fn start(self: &Arc<Self>, requester: Target) -> Result<(), SessionError> {
        match self.loop_state.get() {
            LoopState::Running | LoopState::ShuttingDown => {
                return Err(SessionError::rejected(
                    "Cannot start background process because background process is already running",
                ));
            },
            LoopState::Connecting => {
                return Err(SessionError::rejected("Robot is already connecting!"));
            },
            LoopState::Idle => {},
        }

        let guard = ConnectingGuard::try_acquire(&self.connecting)
            .ok_or_else(|| SessionError::rejected("Robot is already connecting!"))?;
        if !self
            .loop_state
            .compare_exchange(LoopState::Idle, LoopState::Connecting)
        {
            return Err(SessionError::rejected(
                "Cannot start background process because background process is already running",
            ));
        }

        let session = Arc::clone(self);
        self.loop_threads.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name("spot-session-loop".to_string())
            .spawn(move || session.run_loop(requester, guard));

        if let Err(e) = spawned {
            self.loop_threads.fetch_sub(1, Ordering::AcqRel);
            self.mark_idle();
            return Err(e.into());
        }
        Ok(())
    }

    fn run_loop(self: Arc<Self>, requester: Target, guard: ConnectingGuard) {
        info!("Session loop starting");
        let _exit = LoopExit { session: &self };
        self.bus.info(requester, "Connecting...");

        let connected = self.connect_all(requester);
        drop(guard);

        if !connected {
            self.bus.error(requester, "Failed to start processes");
        } else if self.turn_on(requester)
            && self
                .loop_state
                .compare_exchange(LoopState::Connecting, LoopState::Running)
        {
            self.bus.success(requester, "Connected");
            self.bus
                .event(Target::Broadcast, NotificationKind::BgProcess, "start");
            self.broadcast_server_state();

            let ticks = panic::catch_unwind(AssertUnwindSafe(|| self.run_ticks()))
                .unwrap_or_else(|payload| {
                    Err(SessionError::UnrecoverableLoop(format!(
                        "Main loop panicked: {}",
                        panic_message(&*payload)
                    )))
                });
            if let Err(e) = ticks {
                report(&self.bus, Target::Broadcast, &e);
            }
        }
    }

    /// 主循环迭代：保持上电 → 程序步进 → 队列步进
    fn run_ticks(&self) -> Result<(), SessionError> {
        let tick = self.config.defaults.tick_interval();
        while self.loop_state.get().is_running() {
            self.keep_robot_on()?;

            let Some(link) = self.link.load_full() else {
                warn!("Robot link dropped, stopping loop");
                return Ok(());
            };
            self.dispatcher
                .program_step(link.control(), self.store.as_ref(), &self.bus);
            self.dispatcher.queue_step(link.control(), &self.bus);

            thread::sleep(tick);
        }
        Ok(())
    }

    /// 机器人意外断电时重新上电
    ///
    /// 条件：未急停、最近没有侧躺、持有租约。重新上电失败是致命错误。
    fn keep_robot_on(&self) -> Result<(), SessionError> {
        let Some(link) = self.link.load_full() else {
            return Ok(());
        };
        let robot = link.connection();

        let powered = match robot.is_powered_on() {
            Ok(powered) => powered,
            Err(e) => {
                debug!("Power state query failed: {}", e);
                return Ok(());
            },
        };
        if powered
            || self.authority.robot_estopped()
            || robot.is_estopped().unwrap_or(true)
            || link.control().is_rolled_over()
            || !self.authority.has_lease()
        {
            return Ok(());
        }

        warn!("Robot lost power unexpectedly, powering back on");
        if power::turn_on(
            robot,
            self.config.authority.power_timeout(),
            &self.bus,
            Target::Broadcast,
        ) {
            Ok(())
        } else {
            Err(SessionError::UnrecoverableLoop(
                "Failed to turn robot back on".to_string(),
            ))
        }
    }

    /// 拆除：释放全部权限、断开连接、复位会话标志
    fn clear(&self) {
        debug!("Clearing session");
        self.disconnect();
        self.dispatcher.reset(self.config.defaults.auto_run);
        self.accepting
            .store(self.config.defaults.accept_commands, Ordering::Release);
        self.keyboard.reset();
        self.authority.reset();

        self.dispatcher.broadcast_queue(&self.bus);
        self.broadcast_flags();
    }

    /// 主循环退出后的拆除：ShuttingDown → 清理 → Idle
    fn finish_loop(&self) {
        self.loop_state.set(LoopState::ShuttingDown);
        self.clear();
        // 先减计数再回到 Idle，紧随其后的 start 不会看到两个循环线程
        self.loop_threads.fetch_sub(1, Ordering::AcqRel);
        self.mark_idle();
        self.bus
            .event(Target::Broadcast, NotificationKind::BgProcess, "end");
        info!("Session loop exited");
    }

    fn mark_idle(&self) {
        let _lock = self.idle_lock.lock();
        self.loop_state.set(LoopState::Idle);
        self.idle_cv.notify_all();
    }

    /// 结束主循环并等待拆除完成
    pub fn end(&self, requester: Target) -> Result<(), SessionError> {
        self.request_end()?;
        self.wait_until_idle(None);
        self.bus.success(requester, "Main loop ended");
        Ok(())
    }

    /// 请求结束主循环（不等待）
    pub fn request_end(&self) -> Result<(), SessionError> {
        loop {
            let state = self.loop_state.get();
            match state {
                LoopState::Idle => {
                    return Err(SessionError::rejected(
                        "Cannot end main loop because main loop is not running",
                    ));
                },
                LoopState::ShuttingDown => return Ok(()),
                LoopState::Connecting | LoopState::Running => {
                    if self
                        .loop_state
                        .compare_exchange(state, LoopState::ShuttingDown)
                    {
                        info!("Session loop end requested");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// 阻塞直到状态回到 Idle，超时返回 false
    pub fn wait_until_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lock = self.idle_lock.lock();
        while !self.loop_state.get().is_idle() {
            match deadline {
                Some(deadline) => {
                    if self.idle_cv.wait_until(&mut lock, deadline).timed_out() {
                        let idle = self.loop_state.get().is_idle();
                        if !idle {
                            error!("Session loop did not reach Idle within {:?}", timeout);
                        }
                        return idle;
                    }
                },
                None => self.idle_cv.wait(&mut lock),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_loop_state_roundtrip() {
        for state in [
            LoopState::Idle,
            LoopState::Connecting,
            LoopState::Running,
            LoopState::ShuttingDown,
        ] {
            assert_eq!(LoopState::from_u8(state.as_u8()), state);
        }
        assert_eq!(LoopState::from_u8(255), LoopState::Idle);
    }

    #[test]
    fn test_atomic_loop_state_cas() {
        let state = AtomicLoopState::default();
        assert!(state.compare_exchange(LoopState::Idle, LoopState::Connecting));
        assert!(!state.compare_exchange(LoopState::Idle, LoopState::Connecting));
        assert_eq!(state.get(), LoopState::Connecting);
        state.set(LoopState::Idle);
        assert!(state.get().is_idle());
    }

    #[test]
    fn test_connecting_guard_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = ConnectingGuard::try_acquire(&flag).unwrap();
        assert!(ConnectingGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(ConnectingGuard::try_acquire(&flag).is_some());
    }
}
