//! Blink-a-lot - 机器人头部运动控制核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与通道标定合并
//! - **core**: 错误与处置策略、状态快照、优雅关闭、命令编排
//! - **gesture**: 命名手势库与情绪意图
//! - **hardware**: 舵机驱动 trait 与内存模拟驱动
//! - **idle**: 待机行为生成器
//! - **motion**: 通道 PID、姿态向量、固定频率运动调度器
//! - **observability**: 日志初始化
//! - **speech**: 口型事件流与口型动画

pub mod config;
pub mod core;
pub mod gesture;
pub mod hardware;
pub mod idle;
pub mod motion;
pub mod observability;
pub mod speech;
