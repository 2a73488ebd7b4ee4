//! 动作分发与客户端消息处理
//!
//! [`Session::do_action`] 是唯一的字符串动作入口（对应原 HTTP 接口）；
//! [`Session::handle_message`] 处理推送通道上的一条客户端消息。
//! 需要访问网络的获取操作（`connect`、`acquire_estop`、`acquire_lease`）
//! 在独立的短期线程上执行，请求线程不会阻塞。

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_channel::Receiver;
use serde_json::{Map, Value};
use spot_protocol::{ClientMessage, Command, Notification, NotificationKind, ProtocolError};
use tracing::{debug, info};

use crate::Session;
use crate::error::{SessionError, report};
use crate::keyboard::KeyFrame;
use crate::notify::{ClientId, Target};
use crate::state::ServerState;
use crate::supervisor::ConnectingGuard;

/// 动作执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum ActionReply {
    Ok,
    /// `check_if_running`
    Flag(bool),
    /// `get_server_state`
    State(ServerState),
}

fn required<'a>(action: &str, args: Option<&'a str>) -> Result<&'a str, SessionError> {
    args.filter(|name| !name.trim().is_empty()).ok_or_else(|| {
        ProtocolError::MissingArgument {
            action: action.to_string(),
            arg: "name",
        }
        .into()
    })
}

impl Session {
    /// 执行一个会话动作
    ///
    /// 拒绝与失败以 `Err` 返回，由调用方决定如何通知（见 [`report`]）。
    pub fn do_action(
        self: &Arc<Self>,
        action: &str,
        args: Option<&str>,
        requester: Target,
    ) -> Result<ActionReply, SessionError> {
        debug!("Action '{}' from {:?}", action, requester);
        match action {
            "start" => self.start(requester)?,
            "end" => self.end(requester)?,
            "connect" => {
                let guard = self.connecting_guard()?;
                self.spawn_task("connect", move |session| {
                    session.connect(requester);
                    drop(guard);
                })?;
            },
            "disconnect_robot" => {
                self.disconnect();
                self.bus.success(requester, "Disconnected from robot");
            },
            "acquire_estop" => {
                if !self.robot_connected() {
                    return Err(SessionError::rejected(
                        "Cannot acquire Estop because robot is not connected!",
                    ));
                }
                let guard = self.connecting_guard()?;
                self.spawn_task("acquire-estop", move |session| {
                    session.acquire_estop(requester);
                    drop(guard);
                })?;
            },
            "acquire_lease" => {
                if !self.robot_connected() {
                    return Err(SessionError::rejected(
                        "Cannot acquire lease because robot is not connected!",
                    ));
                }
                if !self.authority.has_estop() {
                    return Err(SessionError::rejected(
                        "Cannot acquire lease because Estop has not been acquired!",
                    ));
                }
                let guard = self.connecting_guard()?;
                self.spawn_task("acquire-lease", move |session| {
                    session.acquire_lease(requester);
                    drop(guard);
                })?;
            },
            "acquire_time_sync" => {
                self.acquire_time_sync(requester);
            },
            "clear_time_sync" => self.clear_time_sync(),
            "clear_estop" => self.clear_estop(),
            "clear_lease" => self.clear_lease(),
            "estop" => {
                if self.authority.estop() {
                    self.lock_out_commands();
                }
            },
            "estop_release" => {
                self.authority.release_estop();
            },
            "toggle_estop" => {
                if self.authority.toggle() {
                    self.lock_out_commands();
                }
            },
            "toggle_accept_command" => {
                let accepting = !self.accepting.fetch_xor(true, Ordering::AcqRel);
                self.bus.event(
                    Target::Broadcast,
                    NotificationKind::ToggleAcceptCommand,
                    accepting,
                );
            },
            "toggle_auto_run" => {
                let auto_run = self.dispatcher.toggle_auto_run();
                self.bus
                    .event(Target::Broadcast, NotificationKind::ToggleAutoRun, auto_run);
            },
            "step_command" => {
                if !self.is_running() {
                    return Err(SessionError::rejected("Background process is not running!"));
                }
                if self.dispatcher.is_running_commands() {
                    return Err(SessionError::rejected("Already running commands!"));
                }
                self.dispatcher.arm_step();
            },
            "run_program" => {
                let name = required(action, args)?;
                self.run_program(name, requester)?;
            },
            "remove_program" => {
                let name = required(action, args)?;
                if self.store.delete(name)? {
                    info!("Removed program '{}'", name);
                }
                self.broadcast_programs()?;
            },
            "check_if_running" => return Ok(ActionReply::Flag(self.is_running())),
            "clear_queue" => {
                let cleared = self.dispatcher.queue().clear();
                debug!("Cleared {} queued commands", cleared);
                self.dispatcher.broadcast_queue(&self.bus);
            },
            "get_server_state" => return Ok(ActionReply::State(self.server_state())),
            "power_on" => {
                self.turn_on(requester);
            },
            "power_off" => {
                self.turn_off(requester);
            },
            other => return Err(SessionError::UnknownAction(other.to_string())),
        }
        Ok(ActionReply::Ok)
    }

    fn connecting_guard(&self) -> Result<ConnectingGuard, SessionError> {
        ConnectingGuard::try_acquire(&self.connecting)
            .ok_or_else(|| SessionError::rejected("Robot is already connecting!"))
    }

    /// 急停切断后：停止接收命令并清空队列
    fn lock_out_commands(&self) {
        self.accepting.store(false, Ordering::Release);
        self.dispatcher.queue().clear();
        self.dispatcher.broadcast_queue(&self.bus);
        self.bus
            .event(Target::Broadcast, NotificationKind::ToggleAcceptCommand, false);
    }

    /// 激活一个程序，由主循环在下一次迭代执行
    ///
    /// 未知的程序名被忽略。
    pub fn run_program(&self, name: &str, requester: Target) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::rejected(
                "Cannot run program because background process is not running",
            ));
        }
        if self.dispatcher.is_program_running() {
            return Err(SessionError::rejected(
                "Cannot run program because a program is already running",
            ));
        }
        if !self.store.exists(name)? {
            debug!("Ignoring request to run unknown program '{}'", name);
            return Ok(());
        }
        if !self.dispatcher.start_program(name, requester) {
            return Err(SessionError::rejected(
                "Cannot run program because a program is already running",
            ));
        }
        self.bus.info(requester, "Running Program");
        Ok(())
    }

    /// 追加一条命令到队列
    ///
    /// 只在运动外观存在且接受命令时有效。
    pub fn enqueue(&self, command: Command) -> Result<(), SessionError> {
        if !self.robot_connected() {
            return Err(SessionError::NotConnected);
        }
        if !self.is_accepting_commands() {
            return Err(SessionError::rejected("Server is not accepting commands"));
        }
        command.decode()?;
        let seq = self.dispatcher.queue().push(command);
        debug!("Enqueued command #{}", seq);
        self.dispatcher.broadcast_queue(&self.bus);
        Ok(())
    }

    /// 写入程序并广播程序表
    pub fn save_program(&self, name: &str, commands: Vec<Command>) -> Result<(), SessionError> {
        for command in &commands {
            command.decode()?;
        }
        self.store.write(name, commands)?;
        info!("Saved program '{}'", name);
        self.broadcast_programs()
    }

    /// 全部程序（名称 → 命令列表）
    pub fn programs(&self) -> Result<Map<String, Value>, SessionError> {
        let mut table = Map::new();
        for program in self.store.get_all()? {
            let commands = serde_json::to_value(&program.commands).unwrap_or(Value::Null);
            table.insert(program.name, commands);
        }
        Ok(table)
    }

    fn broadcast_programs(&self) -> Result<(), SessionError> {
        let table = self.programs()?;
        self.bus
            .event(Target::Broadcast, NotificationKind::Programs, Value::Object(table));
        Ok(())
    }

    /// 注册新客户端
    pub fn client_connected(&self) -> (ClientId, Receiver<Notification>) {
        self.bus.subscribe()
    }

    /// 注销客户端并释放其键盘控制权
    pub fn client_disconnected(&self, client: ClientId) {
        if self.keyboard.release(client) {
            info!("Client {} released keyboard control on disconnect", client);
        }
        self.bus.unsubscribe(client);
    }

    /// 处理一条客户端消息，返回 false 表示客户端请求结束读取循环
    pub fn handle_message(self: &Arc<Self>, client: ClientId, message: ClientMessage) -> bool {
        let target = Target::Client(client);
        match message {
            ClientMessage::Unload => return false,
            ClientMessage::Keys { keys_down, keys_up } => {
                if self.keyboard.record(client, KeyFrame::new(keys_down, keys_up)) {
                    self.run_keyboard(client);
                }
            },
            ClientMessage::KeyboardControlStart => {
                if self.keyboard.claim(client) {
                    debug!("Client {} holds keyboard control", client);
                }
            },
            ClientMessage::KeyboardControlRelease => {
                self.keyboard.release(client);
            },
            ClientMessage::Do { name, args } => {
                match self.do_action(&name, args.as_deref(), target) {
                    Ok(ActionReply::Ok) => {},
                    Ok(ActionReply::Flag(running)) => self.bus.event(
                        target,
                        NotificationKind::BgProcess,
                        if running { "start" } else { "end" },
                    ),
                    Ok(ActionReply::State(state)) => self.send_state(target, &state),
                    Err(e) => report(&self.bus, target, &e),
                }
            },
            ClientMessage::Command { command } => {
                if let Err(e) = self.enqueue(command) {
                    report(&self.bus, target, &e);
                }
            },
            ClientMessage::SaveProgram { name, program } => {
                if let Err(e) = self.save_program(&name, program) {
                    report(&self.bus, target, &e);
                }
            },
            ClientMessage::GetPrograms => match self.programs() {
                Ok(table) => {
                    self.bus
                        .event(target, NotificationKind::Programs, Value::Object(table))
                },
                Err(e) => report(&self.bus, target, &e),
            },
            ClientMessage::GetServerState => self.send_state(target, &self.server_state()),
        }
        true
    }

    fn send_state(&self, target: Target, state: &ServerState) {
        match serde_json::to_value(state) {
            Ok(state) => self.bus.event(target, NotificationKind::ServerState, state),
            Err(e) => debug!("Failed to serialize server state: {}", e),
        }
    }

    /// 执行键盘控制持有者最近一帧的动作
    ///
    /// 程序或队列命令执行期间、没有运动外观或机器人未上电时静默忽略。
    fn run_keyboard(&self, client: ClientId) {
        if self.dispatcher.is_program_running() || self.dispatcher.is_running_commands() {
            return;
        }
        let Some(link) = self.link.load_full() else {
            return;
        };
        if !link.connection().is_powered_on().unwrap_or(false) {
            return;
        }

        link.control().set_target(Target::Client(client));
        match self.keyboard.execute(link.control()) {
            Ok(mode) => self.bus.event(
                Target::Broadcast,
                NotificationKind::ControlMode,
                mode.as_str(),
            ),
            Err(e) => report(&self.bus, Target::Client(client), &e),
        }
    }
}
