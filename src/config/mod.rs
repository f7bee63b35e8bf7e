// 配置管理模块

use crate::common::DEFAULT_STALL_TIMEOUT;
use crate::installer::DEFAULT_MANIFEST_SLOW_THRESHOLD;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/llama-herder.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 守护进程配置
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// 拉取配置
    #[serde(default)]
    pub pull: PullConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 守护进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// 守护进程地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 可达性探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 已安装列表查询超时（秒）
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// 删除请求超时（秒）
    #[serde(default = "default_delete_timeout_secs")]
    pub delete_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_list_timeout_secs() -> u64 {
    10
}
fn default_delete_timeout_secs() -> u64 {
    60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
            list_timeout_secs: default_list_timeout_secs(),
            delete_timeout_secs: default_delete_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }
}

/// 拉取配置
///
/// 控制主通道连接、停滞检测和回退安装器的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// 主通道建立连接超时（秒），默认30秒
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 停滞阈值（秒），超过此时长无输出视为停滞，默认60秒
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// 清单阶段提示阈值（秒），默认30秒
    #[serde(default = "default_manifest_slow_secs")]
    pub manifest_slow_secs: u64,

    /// 是否启用命令行回退
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,

    /// 回退安装器程序
    #[serde(default = "default_installer_program")]
    pub installer_program: String,

    /// 回退安装器硬超时（秒），默认600秒
    #[serde(default = "default_fallback_timeout_secs")]
    pub fallback_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT.as_secs()
}
fn default_manifest_slow_secs() -> u64 {
    DEFAULT_MANIFEST_SLOW_THRESHOLD.as_secs()
}
fn default_fallback_enabled() -> bool {
    true
}
fn default_installer_program() -> String {
    "ollama".to_string()
}
fn default_fallback_timeout_secs() -> u64 {
    600
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            manifest_slow_secs: default_manifest_slow_secs(),
            fallback_enabled: default_fallback_enabled(),
            installer_program: default_installer_program(),
            fallback_timeout_secs: default_fallback_timeout_secs(),
        }
    }
}

impl PullConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn manifest_slow_threshold(&self) -> Duration {
        Duration::from_secs(self.manifest_slow_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.daemon.base_url.trim().is_empty() {
            anyhow::bail!("daemon.base_url 不能为空");
        }
        reqwest::Url::parse(&self.daemon.base_url)
            .with_context(|| format!("daemon.base_url 无效: {}", self.daemon.base_url))?;

        let timeouts = [
            ("daemon.probe_timeout_secs", self.daemon.probe_timeout_secs),
            ("daemon.list_timeout_secs", self.daemon.list_timeout_secs),
            ("daemon.delete_timeout_secs", self.daemon.delete_timeout_secs),
            ("pull.connect_timeout_secs", self.pull.connect_timeout_secs),
            ("pull.stall_timeout_secs", self.pull.stall_timeout_secs),
            ("pull.fallback_timeout_secs", self.pull.fallback_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                anyhow::bail!("{} 必须大于 0", name);
            }
        }

        if self.pull.fallback_enabled && self.pull.installer_program.trim().is_empty() {
            anyhow::bail!("启用回退时 pull.installer_program 不能为空");
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
