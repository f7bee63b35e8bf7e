use crate::installer::{ModelId, ProgressEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 尚未启动
    Idle,
    /// 正在连接守护进程
    Connecting,
    /// 拉取清单
    FetchingManifest,
    /// 下载中
    Downloading,
    /// 校验摘要
    Verifying,
    /// 写入清单
    Finalizing,
    /// 清理未使用的层
    CleaningUp,
    /// 已成功
    Succeeded,
    /// 已取消（可恢复）
    Cancelled,
    /// 停滞（需要取消或恢复）
    Stalled,
    /// 失败
    Failed,
}

impl SessionState {
    /// 终态：Succeeded / Failed / Cancelled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// 是否有工作任务正在驱动该会话
    pub fn is_active(self) -> bool {
        !self.is_terminal() && !matches!(self, SessionState::Idle | SessionState::Stalled)
    }

    /// 可由 resume 重新启动
    pub fn is_resumable(self) -> bool {
        matches!(self, SessionState::Cancelled | SessionState::Stalled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::FetchingManifest => "fetching_manifest",
            SessionState::Downloading => "downloading",
            SessionState::Verifying => "verifying",
            SessionState::Finalizing => "finalizing",
            SessionState::CleaningUp => "cleaning_up",
            SessionState::Succeeded => "succeeded",
            SessionState::Cancelled => "cancelled",
            SessionState::Stalled => "stalled",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实际使用的传输通道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// 流式 HTTP 拉取
    Primary,
    /// 命令行安装器
    Fallback,
}

/// 一次状态变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

/// 单个模型的安装会话
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSession {
    /// 模型标识
    pub id: ModelId,
    /// 本次尝试的 ID（每次 start/resume 重新生成）
    pub run_id: String,
    /// 当前状态
    pub state: SessionState,
    /// 当前传输通道
    pub transport: TransportKind,
    /// 总字节数
    pub total_bytes: Option<u64>,
    /// 已下载字节数
    pub downloaded_bytes: u64,
    /// 最后一次收到输出的时间
    #[serde(skip)]
    pub last_event_at: Option<Instant>,
    /// 是否已请求取消
    pub cancel_requested: bool,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub finished_at: Option<i64>,
    /// 失败原因
    pub error: Option<String>,
}

impl DownloadSession {
    pub fn new(id: ModelId) -> Self {
        Self {
            id,
            run_id: Uuid::new_v4().to_string(),
            state: SessionState::Idle,
            transport: TransportKind::Primary,
            total_bytes: None,
            downloaded_bytes: 0,
            last_event_at: None,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// 开始一次新的尝试：清空字节计数，进入 Connecting
    pub fn begin(&mut self) -> Transition {
        self.run_id = Uuid::new_v4().to_string();
        self.transport = TransportKind::Primary;
        self.total_bytes = None;
        self.downloaded_bytes = 0;
        self.last_event_at = None;
        self.cancel_requested = false;
        self.started_at = Some(chrono::Utc::now().timestamp());
        self.finished_at = None;
        self.error = None;
        self.set_state(SessionState::Connecting)
    }

    /// 百分比，范围 [0, 100]；总大小未知时为 None
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }

    /// 应用一个进度事件
    ///
    /// 终态后的事件被忽略；`ManifestStalled` 不改变状态。
    /// 返回实际发生的状态变更（状态未变时为 None）
    pub fn apply(&mut self, event: &ProgressEvent, now: Instant) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.last_event_at = Some(now);

        let next = match event {
            ProgressEvent::ManifestStart => SessionState::FetchingManifest,
            ProgressEvent::ManifestStalled { .. } => return None,
            ProgressEvent::Downloading { completed, total } => {
                if let Some(total) = total {
                    self.total_bytes = Some(*total);
                }
                // 下载阶段字节数只增不减
                self.downloaded_bytes = self.downloaded_bytes.max(*completed);
                SessionState::Downloading
            }
            ProgressEvent::Verifying => SessionState::Verifying,
            ProgressEvent::WritingManifest => SessionState::Finalizing,
            ProgressEvent::CleaningUp => SessionState::CleaningUp,
            ProgressEvent::Succeeded => return self.mark_succeeded(),
            ProgressEvent::Failed { reason } => return self.mark_failed(reason.clone()),
        };

        let transition = self.set_state(next);
        (transition.from != transition.to).then_some(transition)
    }

    /// 切换到回退通道
    pub fn mark_fallback(&mut self) {
        self.transport = TransportKind::Fallback;
    }

    /// 标记为成功
    pub fn mark_succeeded(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        if let Some(total) = self.total_bytes {
            self.downloaded_bytes = self.downloaded_bytes.max(total);
        }
        self.finish(SessionState::Succeeded)
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, reason: String) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.error = Some(reason);
        self.finish(SessionState::Failed)
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.finish(SessionState::Cancelled)
    }

    /// 标记为停滞
    pub fn mark_stalled(&mut self) -> Option<Transition> {
        if !self.state.is_active() {
            return None;
        }
        Some(self.set_state(SessionState::Stalled))
    }

    /// 请求取消
    ///
    /// 空闲或终态时为空操作，返回 false
    pub fn request_cancel(&mut self) -> bool {
        if self.state.is_terminal() || self.state == SessionState::Idle {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    fn finish(&mut self, state: SessionState) -> Option<Transition> {
        self.finished_at = Some(chrono::Utc::now().timestamp());
        Some(self.set_state(state))
    }

    fn set_state(&mut self, state: SessionState) -> Transition {
        let from = self.state;
        self.state = state;
        Transition { from, to: state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn started(id: &str) -> DownloadSession {
        let mut session = DownloadSession::new(ModelId::from(id));
        session.begin();
        session
    }

    #[test]
    fn test_session_creation() {
        let session = DownloadSession::new(ModelId::from("llama3.2:3b"));
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.transport, TransportKind::Primary);
        assert_eq!(session.downloaded_bytes, 0);
        assert_eq!(session.percentage(), None);
        assert!(!session.cancel_requested);
    }

    #[test]
    fn test_event_sequence_reaches_success() {
        let mut session = started("llama3.2:3b");
        let now = Instant::now();
        assert_eq!(session.state, SessionState::Connecting);

        let events = [
            ProgressEvent::ManifestStart,
            ProgressEvent::Downloading {
                completed: 1_000_000,
                total: Some(10_000_000),
            },
            ProgressEvent::Downloading {
                completed: 10_000_000,
                total: Some(10_000_000),
            },
            ProgressEvent::Succeeded,
        ];
        let mut states = vec![session.state];
        for event in &events {
            session.apply(event, now);
            states.push(session.state);
        }

        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::FetchingManifest,
                SessionState::Downloading,
                SessionState::Downloading,
                SessionState::Succeeded,
            ]
        );
        assert_eq!(session.percentage(), Some(100.0));
        assert!(session.finished_at.is_some());
    }

    #[test]
    fn test_finishing_phases() {
        let mut session = started("phi3");
        let now = Instant::now();

        let t = session.apply(&ProgressEvent::Verifying, now).unwrap();
        assert_eq!(t.to, SessionState::Verifying);
        let t = session.apply(&ProgressEvent::WritingManifest, now).unwrap();
        assert_eq!(t.to, SessionState::Finalizing);
        let t = session.apply(&ProgressEvent::CleaningUp, now).unwrap();
        assert_eq!(t.to, SessionState::CleaningUp);
    }

    #[test]
    fn test_repeated_downloading_is_not_a_transition() {
        let mut session = started("phi3");
        let now = Instant::now();
        let first = ProgressEvent::Downloading {
            completed: 10,
            total: Some(100),
        };
        let second = ProgressEvent::Downloading {
            completed: 20,
            total: Some(100),
        };
        assert!(session.apply(&first, now).is_some());
        assert!(session.apply(&second, now).is_none());
        assert_eq!(session.downloaded_bytes, 20);
    }

    #[test]
    fn test_manifest_stalled_keeps_state() {
        let mut session = started("phi3");
        let now = Instant::now();
        session.apply(&ProgressEvent::ManifestStart, now);
        assert!(session
            .apply(&ProgressEvent::ManifestStalled { elapsed_secs: 45 }, now)
            .is_none());
        assert_eq!(session.state, SessionState::FetchingManifest);
    }

    #[test]
    fn test_downloaded_bytes_never_decrease() {
        let mut session = started("phi3");
        let now = Instant::now();
        session.apply(
            &ProgressEvent::Downloading {
                completed: 500,
                total: Some(1000),
            },
            now,
        );
        session.apply(
            &ProgressEvent::Downloading {
                completed: 300,
                total: Some(1000),
            },
            now,
        );
        assert_eq!(session.downloaded_bytes, 500);
        assert_eq!(session.percentage(), Some(50.0));
    }

    #[test]
    fn test_indeterminate_progress_keeps_known_total() {
        let mut session = started("phi3");
        let now = Instant::now();
        session.apply(
            &ProgressEvent::Downloading {
                completed: 0,
                total: None,
            },
            now,
        );
        assert_eq!(session.percentage(), None);

        session.apply(
            &ProgressEvent::Downloading {
                completed: 250,
                total: Some(1000),
            },
            now,
        );
        session.apply(
            &ProgressEvent::Downloading {
                completed: 250,
                total: None,
            },
            now,
        );
        assert_eq!(session.total_bytes, Some(1000));
        assert_eq!(session.percentage(), Some(25.0));
    }

    #[test]
    fn test_percentage_clamped() {
        let mut session = started("phi3");
        session.apply(
            &ProgressEvent::Downloading {
                completed: 1500,
                total: Some(1000),
            },
            Instant::now(),
        );
        assert_eq!(session.percentage(), Some(100.0));
    }

    #[test]
    fn test_failed_event_is_terminal() {
        let mut session = started("phi3");
        let now = Instant::now();
        let t = session
            .apply(
                &ProgressEvent::Failed {
                    reason: "manifest not found".to_string(),
                },
                now,
            )
            .unwrap();
        assert_eq!(t.to, SessionState::Failed);
        assert_eq!(session.error.as_deref(), Some("manifest not found"));

        // 终态后的事件被忽略
        assert!(session.apply(&ProgressEvent::Succeeded, now).is_none());
        assert_eq!(session.state, SessionState::Failed);
    }

    #[test]
    fn test_request_cancel() {
        let mut idle = DownloadSession::new(ModelId::from("phi3"));
        assert!(!idle.request_cancel());
        assert!(!idle.cancel_requested);

        let mut running = started("phi3");
        assert!(running.request_cancel());
        assert!(running.cancel_requested);
        running.mark_cancelled();
        assert_eq!(running.state, SessionState::Cancelled);

        // 已取消再次取消：空操作
        assert!(!running.request_cancel());
    }

    #[test]
    fn test_begin_resets_counters() {
        let mut session = started("phi3");
        let first_run = session.run_id.clone();
        session.apply(
            &ProgressEvent::Downloading {
                completed: 700,
                total: Some(1000),
            },
            Instant::now(),
        );
        session.mark_fallback();
        session.mark_stalled();
        assert_eq!(session.state, SessionState::Stalled);

        let t = session.begin();
        assert_eq!(t.from, SessionState::Stalled);
        assert_eq!(session.state, SessionState::Connecting);
        assert_eq!(session.downloaded_bytes, 0);
        assert_eq!(session.total_bytes, None);
        assert_eq!(session.transport, TransportKind::Primary);
        assert_ne!(session.run_id, first_run);
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Cancelled.is_resumable());
        assert!(!SessionState::Stalled.is_terminal());
        assert!(SessionState::Stalled.is_resumable());
        assert!(!SessionState::Stalled.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Downloading.is_active());
        assert!(!SessionState::Failed.is_resumable());
    }

    proptest! {
        #[test]
        fn prop_percentage_monotonic_and_bounded(
            total in 1u64..=u64::MAX / 2,
            steps in proptest::collection::vec(0u64..=1_000_000u64, 1..50),
        ) {
            let mut session = started("prop");
            let now = Instant::now();
            let mut completed = 0u64;
            let mut last = 0.0f64;

            for step in steps {
                completed = completed.saturating_add(step);
                session.apply(
                    &ProgressEvent::Downloading { completed, total: Some(total) },
                    now,
                );
                let pct = session.percentage().unwrap();
                prop_assert!((0.0..=100.0).contains(&pct));
                prop_assert!(pct >= last);
                last = pct;
            }
        }
    }
}
