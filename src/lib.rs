// Llama Herder Library
// 本地模型守护进程安装管理核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 守护进程API模块
pub mod daemon;

// 安装会话模块
pub mod installer;

// 公共模块（速度估算、停滞检测）
pub mod common;

// 导出常用类型
pub use config::AppConfig;
pub use daemon::{ArtifactDescriptor, DaemonClient, ModelCatalog};
pub use installer::{
    DownloadSession, InstallError, ModelId, Notifier, SessionError, SessionNotification,
    SessionRegistry, SessionState, TransportKind, VerificationOutcome,
};

pub use common::{SpeedEstimator, SpeedReport, StallDetector};
