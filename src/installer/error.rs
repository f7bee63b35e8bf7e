//! 安装流程错误类型
//!
//! - `InstallError`: 传输层与会话层的失败分类，决定会话走向（回退 / 失败 / 停滞）
//! - `CliError`: 回退安装器（子进程）的失败
//! - `SessionError`: 注册表入口（start / resume）的调用约束错误

use crate::installer::ModelId;
use std::time::Duration;
use thiserror::Error;

/// 安装过程中的失败分类
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstallError {
    /// 主流式通道建立前守护进程不可达，触发回退而不是直接失败
    #[error("daemon unreachable: {0}")]
    Connection(String),
    /// 守护进程返回了非成功 HTTP 状态
    #[error("daemon responded with HTTP {status}: {body}")]
    Protocol { status: u16, body: String },
    /// 流读取中途出现不可恢复的错误
    #[error("pull stream read failed: {0}")]
    Stream(String),
    /// 超过停滞阈值未收到任何事件
    #[error("no updates for {} seconds", .idle.as_secs())]
    Stalled { idle: Duration },
    /// 回退安装器失败
    #[error(transparent)]
    Cli(#[from] CliError),
}

impl InstallError {
    /// 是否应切换到回退通道
    pub fn is_connection(&self) -> bool {
        matches!(self, InstallError::Connection(_))
    }

    /// 写入会话 `error` 字段、展示给调用方的失败原因
    pub fn reason(&self) -> String {
        match self {
            InstallError::Protocol { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    format!("daemon responded with HTTP {}", status)
                } else {
                    body.to_string()
                }
            }
            InstallError::Cli(e) => e.reason(),
            other => other.to_string(),
        }
    }
}

/// 回退安装器（子进程）错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CliError {
    /// 无法启动子进程（例如安装器不在 PATH 中）
    #[error("failed to launch installer: {0}")]
    Spawn(String),
    /// 子进程以非零状态退出
    #[error("installer exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    /// 超过硬超时
    #[error("installer timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),
    /// 未配置回退通道
    #[error("offline installer fallback is disabled")]
    Disabled,
}

impl CliError {
    /// 失败原因：优先使用子进程原样输出的 stderr
    pub fn reason(&self) -> String {
        match self {
            CliError::Exit { code, stderr } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    match code {
                        Some(code) => format!("installer exited with code {}", code),
                        None => "installer terminated by signal".to_string(),
                    }
                } else {
                    stderr.to_string()
                }
            }
            other => other.to_string(),
        }
    }
}

/// 注册表入口错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session for {0} is already active")]
    AlreadySessionActive(ModelId),
    #[error("no cancelled or stalled session for {0}")]
    NoCancelledSession(ModelId),
}
