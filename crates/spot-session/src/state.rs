//! 服务端状态快照

use serde::Serialize;
use spot_protocol::Command;

use crate::keyboard::ControlMode;
use crate::notify::ClientId;
use crate::supervisor::LoopState;

/// 会话、队列、程序与键盘控制的当前状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerState {
    pub robot_is_connected: bool,
    pub server_has_estop: bool,
    pub server_has_lease: bool,
    pub server_has_time_sync: bool,
    /// 机器人被本端急停切断
    pub robot_is_estopped: bool,
    pub background_is_running: bool,
    pub loop_state: LoopState,
    pub is_connecting_service: bool,
    pub is_running_commands: bool,
    pub active_program_name: Option<String>,
    pub program_socket_index: Option<ClientId>,
    pub command_queue: Vec<Command>,
    pub is_accepting_commands: bool,
    pub will_auto_run_commands: bool,
    pub should_run_commands: bool,
    pub is_handling_keyboard_commands: bool,
    pub keyboard_control_owner: Option<ClientId>,
    pub keyboard_control_name: ControlMode,
    pub keys_up: Vec<String>,
    pub keys_down: Vec<String>,
}
