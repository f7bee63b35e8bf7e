//! 传输策略
//!
//! - 主通道：守护进程的流式拉取接口，逐行产出原始文本
//! - 回退通道：命令行安装器子进程，没有增量进度，只有结束信号
//!
//! 只有“连接建立失败”才会触发回退；流内容错误、HTTP 错误状态都直接交给会话处理。

use crate::config::PullConfig;
use crate::installer::{CliError, InstallError, ModelId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 拉取流：每项为一行原始文本
pub type LineStream = BoxStream<'static, Result<String, InstallError>>;

/// 主通道：打开一个逐行的拉取流
#[async_trait]
pub trait PullSource: Send + Sync {
    /// 建立拉取流
    ///
    /// 连接阶段失败返回 `InstallError::Connection`，非成功状态码返回 `InstallError::Protocol`
    async fn open_pull(&self, model: &ModelId) -> Result<LineStream, InstallError>;
}

/// 回退通道：一次性完成安装
#[async_trait]
pub trait FallbackInstaller: Send + Sync {
    async fn install(&self, model: &ModelId) -> Result<(), CliError>;
}

/// 命令行安装器：`<program> pull <model>`
#[derive(Debug, Clone)]
pub struct CliInstaller {
    program: String,
    timeout: Duration,
}

impl CliInstaller {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &PullConfig) -> Self {
        Self::new(config.installer_program.clone(), config.fallback_timeout())
    }
}

#[async_trait]
impl FallbackInstaller for CliInstaller {
    async fn install(&self, model: &ModelId) -> Result<(), CliError> {
        info!(
            "启动命令行安装器: {} pull {} (超时 {} 秒)",
            self.program,
            model,
            self.timeout.as_secs()
        );

        let child = Command::new(&self.program)
            .arg("pull")
            .arg(model.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 超时后 future 被丢弃，子进程随之被杀死
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CliError::Spawn(format!("{}: {}", self.program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CliError::Spawn(e.to_string()))?,
            Err(_) => {
                warn!("命令行安装器超时: {} pull {}", self.program, model);
                return Err(CliError::TimedOut(self.timeout));
            }
        };

        if output.status.success() {
            info!("✓ 命令行安装器完成: {}", model);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                "命令行安装器失败: {}, 退出码={:?}, stderr={}",
                model,
                output.status.code(),
                stderr.trim()
            );
            Err(CliError::Exit {
                code: output.status.code(),
                stderr,
            })
        }
    }
}

/// 传输策略：主通道 + 可选的回退通道
#[derive(Clone)]
pub struct TransportStrategy {
    primary: Arc<dyn PullSource>,
    fallback: Option<Arc<dyn FallbackInstaller>>,
}

impl TransportStrategy {
    pub fn new(
        primary: Arc<dyn PullSource>,
        fallback: Option<Arc<dyn FallbackInstaller>>,
    ) -> Self {
        Self { primary, fallback }
    }

    /// 打开主通道
    pub async fn open_primary(&self, model: &ModelId) -> Result<LineStream, InstallError> {
        debug!("打开主拉取通道: {}", model);
        self.primary.open_pull(model).await
    }

    /// 该错误是否应切换到回退通道
    pub fn should_fall_back(&self, err: &InstallError) -> bool {
        err.is_connection() && self.fallback.is_some()
    }

    /// 执行回退安装；不可中途取消，只能等待完成或超时
    pub async fn run_fallback(&self, model: &ModelId) -> Result<(), CliError> {
        match &self.fallback {
            Some(installer) => installer.install(model).await,
            None => Err(CliError::Disabled),
        }
    }
}

impl std::fmt::Debug for TransportStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStrategy")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct RefusingSource;

    #[async_trait]
    impl PullSource for RefusingSource {
        async fn open_pull(&self, _model: &ModelId) -> Result<LineStream, InstallError> {
            Err(InstallError::Connection("connection refused".to_string()))
        }
    }

    struct CannedSource;

    #[async_trait]
    impl PullSource for CannedSource {
        async fn open_pull(&self, _model: &ModelId) -> Result<LineStream, InstallError> {
            let lines = vec![Ok(r#"{"status":"success"}"#.to_string())];
            Ok(futures::stream::iter(lines).boxed())
        }
    }

    struct OkInstaller;

    #[async_trait]
    impl FallbackInstaller for OkInstaller {
        async fn install(&self, _model: &ModelId) -> Result<(), CliError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connection_error_selects_fallback() {
        let strategy = TransportStrategy::new(Arc::new(RefusingSource), Some(Arc::new(OkInstaller)));
        let model = ModelId::from("phi3");

        let err = match strategy.open_primary(&model).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection error"),
        };
        assert!(strategy.should_fall_back(&err));
        assert!(strategy.run_fallback(&model).await.is_ok());
    }

    #[tokio::test]
    async fn test_protocol_error_does_not_fall_back() {
        let strategy = TransportStrategy::new(Arc::new(CannedSource), Some(Arc::new(OkInstaller)));
        let err = InstallError::Protocol {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(!strategy.should_fall_back(&err));

        let mut lines = strategy.open_primary(&ModelId::from("phi3")).await.unwrap();
        assert_eq!(
            lines.next().await.unwrap().unwrap(),
            r#"{"status":"success"}"#
        );
    }

    #[tokio::test]
    async fn test_without_fallback() {
        let strategy = TransportStrategy::new(Arc::new(RefusingSource), None);
        let err = InstallError::Connection("refused".to_string());
        assert!(!strategy.should_fall_back(&err));
        assert_eq!(
            strategy.run_fallback(&ModelId::from("phi3")).await,
            Err(CliError::Disabled)
        );
    }

    #[tokio::test]
    async fn test_missing_installer_program() {
        let installer = CliInstaller::new("definitely-not-an-installer-xyz", Duration::from_secs(5));
        let result = installer.install(&ModelId::from("phi3")).await;
        assert!(matches!(result, Err(CliError::Spawn(_))));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use tempfile::TempDir;

        fn write_script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-installer");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_exit_zero_is_success() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, r#"[ "$1" = "pull" ] && [ "$2" = "phi3:mini" ] || exit 9"#);
            let installer = CliInstaller::new(script.to_str().unwrap(), Duration::from_secs(10));
            assert!(installer.install(&ModelId::from("phi3:mini")).await.is_ok());
        }

        #[tokio::test]
        async fn test_nonzero_exit_captures_stderr() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "echo \"Error: model '$2' not found\" >&2\nexit 3");
            let installer = CliInstaller::new(script.to_str().unwrap(), Duration::from_secs(10));

            let err = installer.install(&ModelId::from("nope")).await.unwrap_err();
            assert_eq!(
                err,
                CliError::Exit {
                    code: Some(3),
                    stderr: "Error: model 'nope' not found\n".to_string(),
                }
            );
            assert_eq!(err.reason(), "Error: model 'nope' not found");
        }

        #[tokio::test]
        async fn test_timeout() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "sleep 30");
            let installer = CliInstaller::new(script.to_str().unwrap(), Duration::from_millis(200));

            let err = installer.install(&ModelId::from("phi3")).await.unwrap_err();
            assert_eq!(err, CliError::TimedOut(Duration::from_millis(200)));
            assert!(err.reason().contains("timed out"));
        }
    }
}
