//! Blink-a-lot
//!
//! 入口：初始化日志、加载配置、创建机器人运行时，从标准输入读取命令（JSON 或纯文本），
//! 收到 Ctrl+C / SIGTERM / quit 时回到安全姿态后退出。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use blinkalot::config::load_config;
use blinkalot::core::{
    create_robot, spawn_command_loop, Command, RobotCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
use blinkalot::hardware::SimulatedDriver;
use blinkalot::motion::ChannelId;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    blinkalot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let pins: HashMap<ChannelId, u8> = cfg
        .channels
        .iter()
        .filter_map(|(name, entry)| Some((name.parse().ok()?, entry.pin?)))
        .collect();
    let driver = SimulatedDriver::new().with_pins(pins);

    let shutdown = Arc::new(ShutdownManager::new());
    let robot = match create_robot(&cfg, Box::new(driver), shutdown.token()) {
        Ok(robot) => Arc::new(robot),
        Err(e) => {
            shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
            return Err(e).context("Failed to start motion core");
        }
    };

    // 信号路径上同步 stop_all，不等待
    let scheduler = robot.handle().clone();
    shutdown.on_shutdown(move || scheduler.stop_all());
    shutdown.install_signal_handlers();

    let cmd_tx = spawn_command_loop(Arc::clone(&robot), Arc::clone(&shutdown));

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(cmd) = Command::parse(&line) {
                        if cmd_tx.send(cmd).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    let _ = cmd_tx.send(Command::Quit);
                    break;
                }
                Err(e) => {
                    tracing::warn!("stdin read failed: {}", e);
                    let _ = cmd_tx.send(Command::Quit);
                    break;
                }
            }
        }
    });

    tracing::info!("Ready. Type text to speak, /nod, /stop, /quit, or JSON commands.");
    shutdown.wait_for_shutdown().await;

    let mut coordinator = ShutdownCoordinator::new().with_timeout(2);
    coordinator.register(RobotCleanup::new(robot));
    coordinator.run_cleanup().await;
    Ok(())
}
