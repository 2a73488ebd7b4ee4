//! 机器人会话层
//!
//! 本 crate 实现远程控制服务端的核心：
//! - 急停 / 租约权限管理（[`authority`]）
//! - 连接建立与拆除（[`connector`]）
//! - 命令队列与程序执行（[`queue`]、[`runner`]）
//! - 主循环状态机（[`supervisor`]）
//! - 键盘控制仲裁（[`keyboard`]）
//! - 客户端通知总线（[`notify`]）
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spot_session::{SessionBuilder, SessionConfig, Target};
//! use spot_store::MemoryProgramStore;
//!
//! let session = SessionBuilder::new(sdk)
//!     .config(SessionConfig::default())
//!     .store(Arc::new(MemoryProgramStore::new()))
//!     .build();
//!
//! session.start(Target::Log)?;
//! // ...
//! session.end(Target::Log)?;
//! ```

pub mod action;
pub mod authority;
pub mod config;
pub mod connector;
pub mod control;
mod error;
pub mod keyboard;
pub mod notify;
pub mod power;
pub mod queue;
pub mod runner;
pub mod state;
pub mod supervisor;
pub mod video;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use spot_protocol::NotificationKind;
use spot_robot::RobotSdk;
use spot_store::{MemoryProgramStore, ProgramStore};
use tracing::{error, warn};

pub use action::ActionReply;
pub use authority::{Acquired, AuthorityManager};
pub use config::{ConfigError, SessionConfig};
pub use connector::{AlwaysReachable, PingProbe, ReachabilityProbe, RobotLink};
pub use control::{MotionControl, SpotControl};
pub use error::{SessionError, report};
pub use keyboard::{ControlMode, KeyFrame, KeyboardArbiter};
pub use notify::{ClientId, NotificationBus, Target};
pub use queue::CommandQueue;
pub use runner::{Dispatcher, do_command};
pub use state::ServerState;
pub use supervisor::{AtomicLoopState, LoopState};
pub use video::{NoStitcher, Stitcher, VideoStreamer};

/// 带超时的线程 join
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // watchdog 线程负责 join，超时后它会继续运行直到目标线程结束
        thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Thread join timeout"),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::other("Watchdog thread disconnected"),
            )),
        }
    }
}

/// 机器人会话（进程内唯一，以 `Arc` 共享）
///
/// 连接、权限与循环状态都保存在这里。主循环线程与权限获取线程
/// 通过 `connecting` 守卫互斥；请求处理线程只读取状态或追加队列。
pub struct Session {
    config: SessionConfig,
    sdk: Arc<dyn RobotSdk>,
    store: Arc<dyn ProgramStore>,
    bus: Arc<NotificationBus>,
    probe: Arc<dyn ReachabilityProbe>,
    stitcher: Arc<dyn Stitcher>,

    link: ArcSwapOption<RobotLink>,
    authority: AuthorityManager,
    dispatcher: Dispatcher,
    keyboard: KeyboardArbiter,

    accepting: AtomicBool,
    connecting: Arc<AtomicBool>,
    loop_state: AtomicLoopState,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    loop_threads: AtomicUsize,
    /// 由请求触发的短期后台任务（连接、获取权限）
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// [`Session`] 构建器
pub struct SessionBuilder {
    sdk: Arc<dyn RobotSdk>,
    config: SessionConfig,
    store: Option<Arc<dyn ProgramStore>>,
    bus: Option<Arc<NotificationBus>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    stitcher: Option<Arc<dyn Stitcher>>,
}

impl SessionBuilder {
    pub fn new(sdk: Arc<dyn RobotSdk>) -> Self {
        Self {
            sdk,
            config: SessionConfig::default(),
            store: None,
            bus: None,
            probe: None,
            stitcher: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// 程序存储（默认：进程内存储）
    pub fn store(mut self, store: Arc<dyn ProgramStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bus(mut self, bus: Arc<NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// 可达性探测（默认：`ping`，配置关闭探测时总是可达）
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 前置图像拼接器（默认：不拼接）
    pub fn stitcher(mut self, stitcher: Arc<dyn Stitcher>) -> Self {
        self.stitcher = Some(stitcher);
        self
    }

    pub fn build(self) -> Arc<Session> {
        let bus = self.bus.unwrap_or_default();
        let probe = self.probe.unwrap_or_else(|| {
            if self.config.robot.probe_reachability {
                Arc::new(PingProbe)
            } else {
                Arc::new(AlwaysReachable)
            }
        });
        let defaults = &self.config.defaults;

        Arc::new(Session {
            authority: AuthorityManager::new(self.config.authority.clone(), Arc::clone(&bus)),
            dispatcher: Dispatcher::new(defaults.auto_run),
            keyboard: KeyboardArbiter::new(),
            accepting: AtomicBool::new(defaults.accept_commands),
            connecting: Arc::new(AtomicBool::new(false)),
            loop_state: AtomicLoopState::default(),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            loop_threads: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            link: ArcSwapOption::empty(),
            sdk: self.sdk,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryProgramStore::new())),
            probe,
            stitcher: self.stitcher.unwrap_or_else(|| Arc::new(NoStitcher)),
            bus,
            config: self.config,
        })
    }
}

impl Session {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn store(&self) -> &dyn ProgramStore {
        self.store.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn authority(&self) -> &AuthorityManager {
        &self.authority
    }

    pub fn keyboard(&self) -> &KeyboardArbiter {
        &self.keyboard
    }

    pub fn robot_connected(&self) -> bool {
        self.link.load().is_some()
    }

    pub fn has_time_sync(&self) -> bool {
        self.link
            .load()
            .as_ref()
            .is_some_and(|link| link.has_time_sync())
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn is_accepting_commands(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// 当前状态快照
    pub fn server_state(&self) -> ServerState {
        let frame = self.keyboard.last_frame();
        ServerState {
            robot_is_connected: self.robot_connected(),
            server_has_estop: self.authority.has_estop(),
            server_has_lease: self.authority.has_lease(),
            server_has_time_sync: self.has_time_sync(),
            robot_is_estopped: self.authority.robot_estopped(),
            background_is_running: self.is_running(),
            loop_state: self.loop_state(),
            is_connecting_service: self.is_connecting(),
            is_running_commands: self.dispatcher.is_running_commands(),
            active_program_name: self.dispatcher.active_program(),
            program_socket_index: match self.dispatcher.program_requester() {
                Some(Target::Client(id)) => Some(id),
                _ => None,
            },
            command_queue: self.dispatcher.queue().snapshot(),
            is_accepting_commands: self.is_accepting_commands(),
            will_auto_run_commands: self.dispatcher.auto_run(),
            should_run_commands: self.dispatcher.step_armed(),
            is_handling_keyboard_commands: self.keyboard.owner().is_some(),
            keyboard_control_owner: self.keyboard.owner(),
            keyboard_control_name: self.keyboard.mode(),
            keys_up: frame.keys_up,
            keys_down: frame.keys_down,
        }
    }

    pub(crate) fn broadcast_server_state(&self) {
        match serde_json::to_value(self.server_state()) {
            Ok(state) => self
                .bus
                .event(Target::Broadcast, NotificationKind::ServerState, state),
            Err(e) => warn!("Failed to serialize server state: {}", e),
        }
    }

    /// 广播可切换的会话标志
    pub(crate) fn broadcast_flags(&self) {
        self.bus.event(
            Target::Broadcast,
            NotificationKind::ToggleAcceptCommand,
            self.is_accepting_commands(),
        );
        self.bus.event(
            Target::Broadcast,
            NotificationKind::ToggleAutoRun,
            self.dispatcher.auto_run(),
        );
        self.bus.event(
            Target::Broadcast,
            NotificationKind::ControlMode,
            self.keyboard.mode().as_str(),
        );
    }

    /// 在独立线程上执行一个短期任务
    pub(crate) fn spawn_task<F>(self: &Arc<Self>, name: &str, task: F) -> Result<(), SessionError>
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let session = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("spot-{}", name))
            .spawn(move || task(&session))?;

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// 等待所有短期后台任务结束
    pub fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let join_timeout = self.config.authority.estop_timeout() + Duration::from_secs(2);
        for task in tasks {
            if let Err(_e) = task.join_timeout(join_timeout) {
                error!(
                    "Background task panicked or failed to finish within {:?}",
                    join_timeout
                );
            }
        }
    }
}
