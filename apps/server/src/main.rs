//! Spot 远程控制服务端主入口
//!
//! 启动顺序：日志 → 单例锁 → 配置 → 程序存储 → 会话 → 推送通道。
//! Ctrl+C 时结束主循环并等待拆除完成后退出。

mod singleton;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use singleton::SingletonLock;
use spot_robot::mock::MockRobot;
use spot_session::{SessionBuilder, SessionConfig, Target};
use spot_store::JsonFileProgramStore;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use transport::Transport;

const APP_DIR: &str = "spot-server";

/// Spot 远程控制服务端
///
/// 维持与机器人的会话（急停、租约、时间同步），执行命令队列与程序，
/// 通过 TCP 推送通道与客户端交换 JSON 消息
#[derive(Parser, Debug)]
#[command(name = "spot-server")]
#[command(about = "Spot remote-control server", long_about = None)]
struct Args {
    /// 推送通道监听地址
    ///
    /// 格式: IP:PORT
    #[arg(long, default_value = "127.0.0.1:8765")]
    listen: String,

    /// 配置文件路径（TOML）
    ///
    /// 默认: `<config_dir>/spot-server/config.toml`，文件不存在时使用默认配置
    #[arg(long)]
    config: Option<PathBuf>,

    /// 程序存储文件路径（JSON）
    ///
    /// 默认: `<data_dir>/spot-server/programs.json`
    #[arg(long)]
    programs: Option<PathBuf>,

    /// 日志目录（每日轮转）
    ///
    /// 默认: `<data_dir>/spot-server/logs`
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// 锁文件路径
    ///
    /// 默认: 运行时目录，其次系统临时目录
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// 启动后立即开始主循环
    #[arg(long)]
    start: bool,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("config.toml")
}

fn default_lock_file() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("spot-server.lock")
}

/// 初始化日志：stderr + 每日轮转的文件
///
/// 返回的 guard 必须存活到进程退出，否则缓冲中的日志会丢失。
fn init_logging(log_dir: &PathBuf) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "spot-server.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spot_server=info,spot_session=info,spot_store=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_dir = args.log_dir.clone().unwrap_or_else(|| data_dir().join("logs"));
    let _log_guard = init_logging(&log_dir)?;

    // 1. 单例锁（只允许一个进程持有机器人会话）
    let lock_file = args.lock_file.clone().unwrap_or_else(default_lock_file);
    let _lock = SingletonLock::try_lock(&lock_file).with_context(|| {
        format!(
            "Failed to acquire singleton lock {} (another spot-server may be running)",
            lock_file.display()
        )
    })?;

    // 2. 配置与程序存储
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = SessionConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let programs_path = args
        .programs
        .clone()
        .unwrap_or_else(|| data_dir().join("programs.json"));
    let store = JsonFileProgramStore::open(&programs_path)
        .with_context(|| format!("Failed to open program store {}", programs_path.display()))?;

    info!("spot-server starting");
    info!("  Listen: {}", args.listen);
    info!("  Config: {}", config_path.display());
    info!("  Programs: {}", programs_path.display());
    info!("  Logs: {}", log_dir.display());
    info!("  Lock file: {}", lock_file.display());
    info!("  Robot: {}", config.robot.address);

    // 3. 会话（目前只有内存模拟机器人后端）
    warn!("Using the simulated robot backend");
    let session = SessionBuilder::new(Arc::new(MockRobot::new()))
        .config(config)
        .store(Arc::new(store))
        .build();

    // 4. 信号处理：通知主线程退出
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to set signal handler")?;

    // 5. 推送通道
    let transport = Transport::bind(&args.listen, Arc::clone(&session))
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    thread::Builder::new()
        .name("spot-accept".to_string())
        .spawn(move || {
            if let Err(e) = transport.serve() {
                error!("Push channel stopped: {}", e);
            }
        })
        .context("Failed to spawn accept thread")?;

    if args.start
        && let Err(e) = session.start(Target::Log)
    {
        warn!("Failed to start main loop: {}", e);
    }

    info!("spot-server started. Press Ctrl+C to stop.");
    let _ = shutdown_rx.recv();
    info!("Received interrupt signal. Shutting down...");

    // 6. 结束主循环并等待拆除；未运行时仍释放独立获取的权限
    if session.request_end().is_ok()
        && !session.wait_until_idle(Some(Duration::from_secs(30)))
    {
        warn!("Main loop did not finish tearing down in time");
    }
    session.join_tasks();
    session.disconnect();

    info!("spot-server stopped");
    Ok(())
}
