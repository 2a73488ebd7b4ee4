//! 命令调度：队列步进与程序执行
//!
//! 主循环每次迭代依次调用 [`Dispatcher::program_step`] 和 [`Dispatcher::queue_step`]，
//! 两者都在主循环线程上同步执行，因此同一时刻只有一个来源在驱动运动外观。
//!
//! 两种失败语义不同：
//!
//! - 程序：第一条失败的命令终止整个程序，剩余命令不再执行
//! - 队列：失败的命令照常弹出，后续命令继续执行

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use spot_protocol::{Action, Command, NotificationKind, ProtocolError};
use spot_robot::EulerZxy;
use spot_store::ProgramStore;
use tracing::{debug, info};

use crate::control::MotionControl;
use crate::error::{SessionError, report};
use crate::notify::{NotificationBus, Target};
use crate::queue::CommandQueue;

#[derive(Debug)]
struct ActiveProgram {
    name: Option<String>,
    requester: Target,
}

/// 队列与程序调度器
#[derive(Debug)]
pub struct Dispatcher {
    queue: CommandQueue,
    auto_run: AtomicBool,
    /// 单步触发（消费一次后复位）
    step_armed: AtomicBool,
    running_commands: AtomicBool,
    program_running: AtomicBool,
    program: Mutex<ActiveProgram>,
}

impl Dispatcher {
    pub fn new(auto_run: bool) -> Self {
        Self {
            queue: CommandQueue::new(),
            auto_run: AtomicBool::new(auto_run),
            step_armed: AtomicBool::new(false),
            running_commands: AtomicBool::new(false),
            program_running: AtomicBool::new(false),
            program: Mutex::new(ActiveProgram {
                name: None,
                requester: Target::Log,
            }),
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn auto_run(&self) -> bool {
        self.auto_run.load(Ordering::Acquire)
    }

    pub fn set_auto_run(&self, enabled: bool) {
        self.auto_run.store(enabled, Ordering::Release);
    }

    /// 切换自动执行，返回新值
    pub fn toggle_auto_run(&self) -> bool {
        !self.auto_run.fetch_xor(true, Ordering::AcqRel)
    }

    /// 允许下一次队列步进执行一条命令
    pub fn arm_step(&self) {
        self.step_armed.store(true, Ordering::Release);
    }

    pub fn step_armed(&self) -> bool {
        self.step_armed.load(Ordering::Acquire)
    }

    pub fn is_running_commands(&self) -> bool {
        self.running_commands.load(Ordering::Acquire)
    }

    pub fn is_program_running(&self) -> bool {
        self.program_running.load(Ordering::Acquire)
    }

    pub fn active_program(&self) -> Option<String> {
        self.program.lock().name.clone()
    }

    /// 请求方（程序的输出目标）
    pub fn program_requester(&self) -> Option<Target> {
        let program = self.program.lock();
        program.name.as_ref().map(|_| program.requester)
    }

    /// 激活一个程序，已有程序在运行时返回 false
    pub fn start_program(&self, name: &str, requester: Target) -> bool {
        if self
            .program_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.program.lock() = ActiveProgram {
            name: Some(name.to_string()),
            requester,
        };
        true
    }

    /// 程序步进：执行被激活的程序中的全部命令
    ///
    /// 返回本次是否有程序被执行。无论成败，激活标志都会被清除。
    pub fn program_step(
        &self,
        control: &dyn MotionControl,
        store: &dyn ProgramStore,
        bus: &NotificationBus,
    ) -> bool {
        if !self.is_program_running() {
            return false;
        }
        let (name, requester) = {
            let program = self.program.lock();
            (program.name.clone(), program.requester)
        };

        if let Some(name) = name {
            control.set_target(Target::Broadcast);
            match Self::run_program(&name, control, store) {
                Ok(steps) => info!("Program '{}' finished ({} commands)", name, steps),
                Err(e) => report(bus, requester, &e),
            }
        }

        *self.program.lock() = ActiveProgram {
            name: None,
            requester: Target::Log,
        };
        self.program_running.store(false, Ordering::Release);
        true
    }

    fn run_program(
        name: &str,
        control: &dyn MotionControl,
        store: &dyn ProgramStore,
    ) -> Result<usize, SessionError> {
        let program = store.get(name)?;
        info!("Running program '{}' ({} commands)", program.name, program.commands.len());
        for (step, command) in program.commands.iter().enumerate() {
            do_command(control, command).map_err(|source| SessionError::ProgramExecution {
                program: program.name.clone(),
                step,
                source: Box::new(source),
            })?;
        }
        Ok(program.commands.len())
    }

    /// 队列步进
    ///
    /// - 单步触发已设置：执行队首一条命令
    /// - 自动执行开启：执行直到队列为空
    ///
    /// 每条命令执行后（无论成败）弹出并广播队列内容。返回执行的命令数。
    pub fn queue_step(&self, control: &dyn MotionControl, bus: &NotificationBus) -> usize {
        let armed = self.step_armed.swap(false, Ordering::AcqRel);
        if !armed && !self.auto_run() {
            return 0;
        }
        if self.queue.is_empty() {
            if armed {
                bus.info(Target::Broadcast, "Command List is empty!");
            }
            return 0;
        }

        self.running_commands.store(true, Ordering::Release);
        control.set_target(Target::Broadcast);

        let mut executed = 0;
        if armed && self.execute_front(control, bus) {
            executed += 1;
        }
        while self.auto_run() && self.execute_front(control, bus) {
            executed += 1;
        }

        self.running_commands.store(false, Ordering::Release);
        executed
    }

    fn execute_front(&self, control: &dyn MotionControl, bus: &NotificationBus) -> bool {
        let Some(item) = self.queue.front() else {
            return false;
        };

        if let Err(e) = do_command(control, &item.command) {
            report(bus, Target::Broadcast, &e);
        }

        if self.queue.pop_if(item.seq).is_none() {
            // 执行期间队列被清空
            bus.warning(Target::Log, "Command List is empty!");
        }
        self.broadcast_queue(bus);
        true
    }

    /// 广播队列当前内容
    pub fn broadcast_queue(&self, bus: &NotificationBus) {
        let snapshot = serde_json::to_value(self.queue.snapshot()).unwrap_or(Value::Null);
        bus.event(Target::Broadcast, NotificationKind::CommandQueue, snapshot);
    }

    /// 复位到初始状态（清空队列）
    pub fn reset(&self, auto_run: bool) {
        self.queue.clear();
        self.auto_run.store(auto_run, Ordering::Release);
        self.step_armed.store(false, Ordering::Release);
        self.running_commands.store(false, Ordering::Release);
        *self.program.lock() = ActiveProgram {
            name: None,
            requester: Target::Log,
        };
        self.program_running.store(false, Ordering::Release);
    }
}

fn radians(degrees: f64) -> f64 {
    degrees.to_radians()
}

/// 执行单条命令
///
/// 未知的动作标签被静默忽略（只记录调试日志）。
pub fn do_command(control: &dyn MotionControl, command: &Command) -> Result<(), SessionError> {
    execute(control, command).map_err(|source| SessionError::CommandExecution {
        command: command.to_string(),
        source: Box::new(source),
    })
}

fn execute(control: &dyn MotionControl, command: &Command) -> Result<(), SessionError> {
    match command.decode()? {
        Action::Stand => control.stand()?,
        Action::Sit => control.sit()?,
        Action::Wait(duration) => thread::sleep(duration),
        Action::Rotate(euler) => control.rotate(EulerZxy::new(
            radians(euler.yaw),
            radians(euler.roll),
            radians(euler.pitch),
        ))?,
        Action::RotateBy(euler) => {
            // 运动外观会再乘以旋转速度，这里先除掉
            let scale = control.rotation_velocity().max(f64::EPSILON);
            control.keyboard_rotate(
                radians(euler.yaw) / scale,
                radians(euler.roll) / scale,
                radians(euler.pitch) / scale,
            )?
        },
        Action::SetHeight(height) => control.set_height(height)?,
        Action::Move { x, y, z } => {
            let length = x.hypot(y);
            if length < 1.0 {
                control.walk(x, y, radians(z), Duration::from_secs(1))?;
            } else {
                let duration = Duration::try_from_secs_f64(length).map_err(|e| {
                    ProtocolError::InvalidArgument {
                        action: command.action.clone(),
                        arg: "x",
                        reason: e.to_string(),
                    }
                })?;
                control.walk(x / length, y / length, radians(z / length), duration)?;
            }
        },
        Action::MoveTo { x, y, heading } => control.move_to(x, y, radians(heading))?,
        Action::SetLocomotionHint(hint) => control.set_locomotion_hint(hint),
        Action::Dance(name) => control.dance(&name)?,
        Action::Unrecognized(action) => debug!("Ignoring unrecognized command '{}'", action),
    }
    Ok(())
}
