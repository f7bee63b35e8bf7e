//! 会话通知
//!
//! 工作任务只向通道投递通知，观察者在自己的循环中消费，
//! 回调永远不在工作任务上内联执行。
//! 每条通知在发出时即携带完整数据快照，避免连续进度事件之间的值串扰。

use crate::common::SpeedReport;
use crate::installer::{ModelId, SessionState, TransportKind, VerificationOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// 会话通知
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionNotification {
    /// 会话已登记，准备开始
    Preparing { model: ModelId, run_id: String },
    /// 状态变更
    StatusChanged {
        model: ModelId,
        old_status: SessionState,
        new_status: SessionState,
    },
    /// 面向用户的状态描述
    Status { model: ModelId, message: String },
    /// 下载进度
    Progress {
        model: ModelId,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        /// None 表示暂无进度信息
        percentage: Option<f64>,
        speed: SpeedReport,
        message: String,
    },
    /// 主通道不可用，切换到命令行安装器
    FallbackActivated { model: ModelId, reason: String },
    /// 安装成功
    Completed {
        model: ModelId,
        transport: TransportKind,
        completed_at: i64,
    },
    /// 安装失败
    Failed { model: ModelId, error: String },
    /// 已取消
    Cancelled { model: ModelId },
    /// 停滞
    Stalled {
        model: ModelId,
        idle_secs: u64,
        message: String,
    },
    /// 安装后校验结果（建议性，不改变会话终态）
    Verification {
        model: ModelId,
        outcome: VerificationOutcome,
    },
}

impl SessionNotification {
    pub fn model(&self) -> &ModelId {
        match self {
            SessionNotification::Preparing { model, .. } => model,
            SessionNotification::StatusChanged { model, .. } => model,
            SessionNotification::Status { model, .. } => model,
            SessionNotification::Progress { model, .. } => model,
            SessionNotification::FallbackActivated { model, .. } => model,
            SessionNotification::Completed { model, .. } => model,
            SessionNotification::Failed { model, .. } => model,
            SessionNotification::Cancelled { model } => model,
            SessionNotification::Stalled { model, .. } => model,
            SessionNotification::Verification { model, .. } => model,
        }
    }

    /// 本次尝试的最终通知（Completed / Failed / Cancelled / Stalled）
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionNotification::Completed { .. }
                | SessionNotification::Failed { .. }
                | SessionNotification::Cancelled { .. }
                | SessionNotification::Stalled { .. }
        )
    }

    /// 事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            SessionNotification::Preparing { .. } => "preparing",
            SessionNotification::StatusChanged { .. } => "status_changed",
            SessionNotification::Status { .. } => "status",
            SessionNotification::Progress { .. } => "progress",
            SessionNotification::FallbackActivated { .. } => "fallback_activated",
            SessionNotification::Completed { .. } => "completed",
            SessionNotification::Failed { .. } => "failed",
            SessionNotification::Cancelled { .. } => "cancelled",
            SessionNotification::Stalled { .. } => "stalled",
            SessionNotification::Verification { .. } => "verification",
        }
    }
}

/// 通知接收端，由观察者持有并在自己的循环中消费
pub type NotificationReceiver = mpsc::UnboundedReceiver<SessionNotification>;

/// 通知发送端
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<SessionNotification>,
}

impl Notifier {
    /// 创建通知通道
    pub fn channel() -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 投递通知；观察者已退出时静默丢弃
    pub fn send(&self, notification: SessionNotification) {
        if let Err(e) = self.tx.send(notification) {
            debug!(
                "通知接收端已关闭，丢弃 {} 通知: model={}",
                e.0.event_type_name(),
                e.0.model()
            );
        }
    }

    pub fn status(&self, model: &ModelId, message: impl Into<String>) {
        self.send(SessionNotification::Status {
            model: model.clone(),
            message: message.into(),
        });
    }
}
