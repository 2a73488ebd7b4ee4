//! 队列、程序、键盘与动作分发集成测试

mod common;

use std::thread;
use std::time::Duration;

use common::{session, start_running, wait_for};
use spot_protocol::{ClientMessage, Command, NotificationKind, Severity};
use spot_robot::RobotCommand;
use spot_robot::mock::MockRobot;
use spot_session::{ActionReply, SessionError, Target};

fn command_names(robot: &MockRobot) -> Vec<&'static str> {
    robot.commands().iter().map(RobotCommand::name).collect()
}

#[test]
fn test_lease_requires_estop() {
    let robot = MockRobot::new();
    let session = session(&robot);

    session.do_action("connect", None, Target::Log).unwrap();
    session.join_tasks();
    assert!(session.robot_connected());

    let err = session
        .do_action("acquire_lease", None, Target::Log)
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));
    assert!(!session.acquire_lease(Target::Log));
    assert_eq!(robot.call_count("lease.acquire"), 0);

    session.do_action("acquire_estop", None, Target::Log).unwrap();
    session.join_tasks();
    assert!(session.authority().has_estop());

    session.do_action("acquire_lease", None, Target::Log).unwrap();
    session.join_tasks();
    assert!(session.authority().has_lease());
    assert_eq!(robot.call_count("lease.acquire"), 1);

    session.disconnect();
}

#[test]
fn test_acquire_estop_is_idempotent() {
    let robot = MockRobot::new();
    let session = session(&robot);
    assert!(session.connect(Target::Log));

    assert!(session.acquire_estop(Target::Log));
    assert!(session.acquire_estop(Target::Log));
    assert_eq!(robot.call_count("estop.create_endpoint"), 1);

    session.disconnect();
}

#[test]
fn test_clear_estop_clears_everything() {
    let robot = MockRobot::new();
    let session = session(&robot);

    // 从未持有任何权限
    session.clear_estop();
    assert!(!session.authority().has_estop());
    assert!(!session.authority().has_lease());

    assert!(session.connect_all(Target::Log));
    assert!(session.authority().has_lease());

    session.clear_estop();
    assert!(!session.authority().has_estop());
    assert!(!session.authority().has_lease());
    assert!(robot.active_lease().is_none());
    assert!(!robot.estop_keep_alive_running());

    session.disconnect();
}

#[test]
fn test_acquire_without_connection_is_rejected() {
    let robot = MockRobot::new();
    let session = session(&robot);

    let err = session
        .do_action("acquire_estop", None, Target::Log)
        .unwrap_err();
    assert!(err.user_message().unwrap().contains("not connected"));
    assert!(!session.is_connecting());
    assert!(robot.calls().is_empty());
}

#[test]
fn test_auto_run_drains_queue_past_failure() {
    let robot = MockRobot::new();
    robot.fail_commands_where(|command| matches!(command, RobotCommand::SynchroSit));
    let session = session(&robot);
    start_running(&session);

    session.enqueue(Command::stand()).unwrap();
    session.enqueue(Command::sit()).unwrap();
    session.enqueue(Command::dance("twist")).unwrap();
    assert_eq!(session.dispatcher().queue().len(), 3);

    session.do_action("toggle_auto_run", None, Target::Log).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        session.dispatcher().queue().is_empty() && robot.call_count("command") == 3
    }));
    assert_eq!(command_names(&robot), vec!["stand", "choreography"]);

    session.end(Target::Log).unwrap();
}

#[test]
fn test_single_step_runs_one_command() {
    let robot = MockRobot::new();
    let session = session(&robot);
    start_running(&session);

    for _ in 0..3 {
        session.enqueue(Command::stand()).unwrap();
    }
    session.do_action("step_command", None, Target::Log).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        session.dispatcher().queue().len() == 2
    }));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(session.dispatcher().queue().len(), 2);
    assert!(!session.dispatcher().step_armed());
    assert_eq!(robot.call_count("command"), 1);

    session.end(Target::Log).unwrap();
}

#[test]
fn test_step_command_requires_running_loop() {
    let robot = MockRobot::new();
    let session = session(&robot);

    let err = session
        .do_action("step_command", None, Target::Log)
        .unwrap_err();
    assert_eq!(
        err.user_message().as_deref(),
        Some("Background process is not running!")
    );
    assert!(!session.dispatcher().step_armed());
}

#[test]
fn test_program_aborts_on_failure() {
    let robot = MockRobot::new();
    robot.fail_commands_where(|command| matches!(command, RobotCommand::SynchroSit));
    let session = session(&robot);
    session
        .save_program(
            "Routine",
            vec![Command::stand(), Command::sit(), Command::dance("twist")],
        )
        .unwrap();
    start_running(&session);

    let (client, rx) = session.client_connected();
    session
        .do_action("run_program", Some("routine"), Target::Client(client))
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        !session.dispatcher().is_program_running()
    }));

    assert_eq!(robot.call_count("command"), 2);
    assert_eq!(command_names(&robot), vec!["stand"]);
    assert!(session.dispatcher().active_program().is_none());

    let errors: Vec<_> = rx
        .try_iter()
        .filter(|n| n.severity == Some(Severity::Error))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].text(), Some("Could not perform this action"));

    session.end(Target::Log).unwrap();
}

#[test]
fn test_run_program_rejections() {
    let robot = MockRobot::new();
    let session = session(&robot);
    session.save_program("Routine", vec![Command::stand()]).unwrap();

    let err = session
        .do_action("run_program", Some("Routine"), Target::Log)
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));

    let err = session
        .do_action("run_program", None, Target::Log)
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));

    start_running(&session);
    // 未知程序被忽略
    session
        .do_action("run_program", Some("Missing"), Target::Log)
        .unwrap();
    assert!(!session.dispatcher().is_program_running());

    session.end(Target::Log).unwrap();
}

#[test]
fn test_save_program_updates_case_insensitively() {
    let robot = MockRobot::new();
    let session = session(&robot);

    session.save_program("Foo", vec![Command::stand()]).unwrap();
    session
        .save_program("foo", vec![Command::sit(), Command::wait(0.5)])
        .unwrap();

    let programs = session.programs().unwrap();
    assert_eq!(programs.len(), 1);
    let (name, commands) = programs.iter().next().unwrap();
    assert!(name.eq_ignore_ascii_case("foo"));
    assert_eq!(commands.as_array().unwrap().len(), 2);

    session
        .do_action("remove_program", Some("FOO"), Target::Log)
        .unwrap();
    assert!(session.programs().unwrap().is_empty());
}

#[test]
fn test_enqueue_requires_connection() {
    let robot = MockRobot::new();
    let session = session(&robot);

    let err = session.enqueue(Command::stand()).unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert!(session.dispatcher().queue().is_empty());
}

#[test]
fn test_keyboard_owner_priority() {
    let robot = MockRobot::new();
    let session = session(&robot);
    start_running(&session);

    let (owner, rx) = session.client_connected();
    let (other, _other_rx) = session.client_connected();
    assert!(session.handle_message(owner, ClientMessage::KeyboardControlStart));
    assert!(session.handle_message(other, ClientMessage::KeyboardControlStart));
    assert_eq!(session.keyboard().owner(), Some(owner));

    // 非持有者的按键被忽略
    session.handle_message(
        other,
        ClientMessage::Keys {
            keys_down: vec!["f".to_string()],
            keys_up: vec![],
        },
    );
    assert!(command_names(&robot).is_empty());

    session.handle_message(
        owner,
        ClientMessage::Keys {
            keys_down: vec!["x".to_string(), "w".to_string()],
            keys_up: vec![],
        },
    );
    assert_eq!(command_names(&robot), vec!["battery_change_pose"]);
    assert!(
        rx.try_iter()
            .any(|n| n.kind == NotificationKind::ControlMode)
    );

    session.client_disconnected(owner);
    assert_eq!(session.keyboard().owner(), None);
    assert!(session.handle_message(other, ClientMessage::KeyboardControlStart));
    assert_eq!(session.keyboard().owner(), Some(other));

    session.end(Target::Log).unwrap();
}

#[test]
fn test_unload_ends_read_loop() {
    let robot = MockRobot::new();
    let session = session(&robot);
    let (client, _rx) = session.client_connected();
    assert!(!session.handle_message(client, ClientMessage::Unload));
}

#[test]
fn test_unknown_action_is_reported() {
    let robot = MockRobot::new();
    let session = session(&robot);
    let (client, rx) = session.client_connected();
    let _ = rx.try_recv();

    session.handle_message(
        client,
        ClientMessage::Do {
            name: "teleport".to_string(),
            args: None,
        },
    );
    let notification = rx.try_recv().unwrap();
    assert_eq!(notification.severity, Some(Severity::Error));
    assert_eq!(notification.text(), Some("Command not recognized: teleport"));
}

#[test]
fn test_check_if_running_and_state() {
    let robot = MockRobot::new();
    let session = session(&robot);

    assert_eq!(
        session
            .do_action("check_if_running", None, Target::Log)
            .unwrap(),
        ActionReply::Flag(false)
    );
    start_running(&session);
    assert_eq!(
        session
            .do_action("check_if_running", None, Target::Log)
            .unwrap(),
        ActionReply::Flag(true)
    );

    match session
        .do_action("get_server_state", None, Target::Log)
        .unwrap()
    {
        ActionReply::State(state) => {
            assert!(state.robot_is_connected);
            assert!(state.server_has_estop);
            assert!(state.server_has_lease);
            assert!(state.background_is_running);
        },
        other => panic!("unexpected reply: {:?}", other),
    }

    session.end(Target::Log).unwrap();
}
