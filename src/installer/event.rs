//! 拉取流事件解析
//!
//! 守护进程的 `/api/pull` 响应每行一个 JSON 对象，`status` 字段为自由文本。
//! 这里把它收敛为封闭的 `PullStatus` 枚举（未知值落入 `Unrecognized`），
//! 再归一化为会话状态机消费的 `ProgressEvent`。
//!
//! 解析失败的行直接丢弃，调用方继续读取下一行，不视为错误。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 清单阶段超过此时长后，重复的 `pulling manifest` 行会升级为 `ManifestStalled`
pub const DEFAULT_MANIFEST_SLOW_THRESHOLD: Duration = Duration::from_secs(30);

/// 归一化后的进度事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 开始拉取清单
    ManifestStart,
    /// 清单阶段耗时过长
    ManifestStalled { elapsed_secs: u64 },
    /// 下载中；`total` 缺失表示暂无进度信息
    Downloading { completed: u64, total: Option<u64> },
    /// 校验 sha256
    Verifying,
    /// 写入清单
    WritingManifest,
    /// 清理未使用的层
    CleaningUp,
    /// 安装成功
    Succeeded,
    /// 守护进程报告失败
    Failed { reason: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Succeeded | ProgressEvent::Failed { .. })
    }
}

/// 协议中的 `status` 字面量
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum PullStatus {
    #[serde(rename = "pulling manifest")]
    PullingManifest,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "verifying sha256 digest")]
    VerifyingDigest,
    #[serde(rename = "writing manifest")]
    WritingManifest,
    #[serde(rename = "removing any unused layers")]
    RemovingUnusedLayers,
    #[serde(rename = "success")]
    Success,
    /// 其他任意状态：无害的进度行，忽略
    #[serde(other)]
    Unrecognized,
}

/// 单行原始记录
///
/// `total`/`completed` 以 `Value` 接收，非数字时降级为“暂无进度”而不是整行解析失败
#[derive(Debug, Deserialize)]
struct PullLine {
    #[serde(default)]
    status: Option<PullStatus>,
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    completed: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// 拉取流解析器
///
/// 有状态：记录上一次已知的 `completed`（用于不定进度事件）和清单阶段开始时间。
/// 每次拉取尝试使用一个新的解析器。
#[derive(Debug)]
pub struct StreamEventParser {
    last_completed: u64,
    manifest_started_at: Option<Instant>,
    manifest_slow_threshold: Duration,
}

impl StreamEventParser {
    pub fn new(manifest_slow_threshold: Duration) -> Self {
        Self {
            last_completed: 0,
            manifest_started_at: None,
            manifest_slow_threshold,
        }
    }

    /// 解析一行
    ///
    /// # 返回
    /// - `Some(event)`: 可识别的事件
    /// - `None`: 空行、无法解码的行、未知状态或无需上报的重复清单行
    pub fn parse(&mut self, line: &str, now: Instant) -> Option<ProgressEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let record: PullLine = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                debug!("跳过无法解析的拉取行: {} ({})", line, e);
                return None;
            }
        };

        if let Some(reason) = record.error {
            return Some(ProgressEvent::Failed { reason });
        }

        match record.status? {
            PullStatus::PullingManifest => match self.manifest_started_at {
                None => {
                    self.manifest_started_at = Some(now);
                    Some(ProgressEvent::ManifestStart)
                }
                Some(started) => {
                    let elapsed = now.saturating_duration_since(started);
                    if elapsed > self.manifest_slow_threshold {
                        Some(ProgressEvent::ManifestStalled {
                            elapsed_secs: elapsed.as_secs(),
                        })
                    } else {
                        None
                    }
                }
            },
            PullStatus::Downloading => {
                let completed = record.completed.as_ref().and_then(Value::as_u64);
                let total = record.total.as_ref().and_then(Value::as_u64);
                match (completed, total) {
                    (Some(completed), Some(total)) => {
                        self.last_completed = completed;
                        Some(ProgressEvent::Downloading {
                            completed,
                            total: Some(total),
                        })
                    }
                    _ => Some(ProgressEvent::Downloading {
                        completed: self.last_completed,
                        total: None,
                    }),
                }
            }
            PullStatus::VerifyingDigest => Some(ProgressEvent::Verifying),
            PullStatus::WritingManifest => Some(ProgressEvent::WritingManifest),
            PullStatus::RemovingUnusedLayers => Some(ProgressEvent::CleaningUp),
            PullStatus::Success => Some(ProgressEvent::Succeeded),
            PullStatus::Unrecognized => {
                debug!("忽略未识别的拉取状态: {}", line);
                None
            }
        }
    }
}

impl Default for StreamEventParser {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_SLOW_THRESHOLD)
    }
}
