//! 会话工作任务
//!
//! 每个会话一个 tokio 任务：先走主通道，连接失败时切换回退安装器；
//! 读取循环在每一行边界同时观察取消令牌和停滞截止时间。

use crate::common::{SpeedEstimator, StallDetector};
use crate::config::PullConfig;
use crate::daemon::ModelCatalog;
use crate::installer::{
    DownloadSession, InstallError, LineStream, ModelId, Notifier, ProgressEvent,
    SessionNotification, StreamEventParser, Transition, TransportStrategy, VerificationProbe,
};
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 流结束但守护进程未报告成功时的失败原因
pub const STREAM_ENDED_EARLY: &str = "pull stream ended before the daemon reported success";

/// 回退通知中的原因描述
pub const FALLBACK_REASON: &str = "falling back to offline installer";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 单个会话的工作任务
pub struct SessionWorker {
    model: ModelId,
    session: Arc<RwLock<DownloadSession>>,
    transport: TransportStrategy,
    catalog: Arc<dyn ModelCatalog>,
    notifier: Notifier,
    cancel: CancellationToken,
    stall_timeout: Duration,
    manifest_slow_threshold: Duration,
}

impl SessionWorker {
    pub fn new(
        session: Arc<RwLock<DownloadSession>>,
        transport: TransportStrategy,
        catalog: Arc<dyn ModelCatalog>,
        notifier: Notifier,
        cancel: CancellationToken,
        config: &PullConfig,
    ) -> Self {
        let model = session.read().id.clone();
        Self {
            model,
            session,
            transport,
            catalog,
            notifier,
            cancel,
            stall_timeout: config.stall_timeout(),
            manifest_slow_threshold: config.manifest_slow_threshold(),
        }
    }

    /// 驱动会话直到进入终态或停滞
    pub async fn run(self) {
        info!("开始安装模型: {}", self.model);
        self.notifier
            .status(&self.model, "Testing connection to daemon...");

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.finish_cancelled();
                return;
            }
            opened = self.transport.open_primary(&self.model) => opened,
        };

        match opened {
            Ok(lines) => self.drive_stream(lines).await,
            Err(e) if self.transport.should_fall_back(&e) => self.run_fallback(e).await,
            Err(e) => {
                warn!("主通道不可用且无法回退: {}, 错误: {}", self.model, e);
                self.finish_failed(e.reason());
            }
        }
    }

    /// 读取主通道直到终态事件、取消、停滞或流结束
    async fn drive_stream(&self, mut lines: LineStream) {
        let mut parser = StreamEventParser::new(self.manifest_slow_threshold);
        let mut speed = SpeedEstimator::new();
        let mut stall = StallDetector::new(self.stall_timeout, Instant::now());

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.finish_cancelled();
                    return;
                }
                _ = tokio::time::sleep_until(stall.deadline()) => {
                    let now = Instant::now();
                    if stall.is_stalled(now) {
                        self.finish_stalled(stall.idle(now));
                        return;
                    }
                    continue;
                }
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!("读取拉取流失败: {}, 错误: {}", self.model, e);
                    self.finish_failed(e.reason());
                    return;
                }
                None => {
                    warn!("拉取流提前结束: {}", self.model);
                    self.finish_failed(STREAM_ENDED_EARLY.to_string());
                    return;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let now = Instant::now();
            stall.touch(now);

            let Some(event) = parser.parse(&line, now) else {
                continue;
            };
            if self.handle_event(event, now, &mut speed) {
                return;
            }
        }
    }

    /// 处理一个进度事件，返回是否已到达终态
    fn handle_event(&self, event: ProgressEvent, now: Instant, speed: &mut SpeedEstimator) -> bool {
        let (transition, snapshot) = {
            let mut session = self.session.write();
            let transition = session.apply(&event, now);
            (transition, session.clone())
        };
        if let Some(transition) = transition {
            self.notify_transition(transition);
        }

        let terminal = event.is_terminal();
        match event {
            ProgressEvent::ManifestStalled { elapsed_secs } => {
                self.notifier.status(
                    &self.model,
                    format!(
                        "Still fetching manifest for {} ({}s elapsed), the registry may be slow...",
                        self.model, elapsed_secs
                    ),
                );
            }
            ProgressEvent::Downloading { total, .. } => {
                // 只有带计数的行参与速度采样
                let report = match total {
                    Some(_) => speed.sample(now, snapshot.downloaded_bytes, snapshot.total_bytes),
                    None => speed.current(),
                };
                let message = match snapshot.total_bytes {
                    Some(total) if total > 0 => format!(
                        "Downloading {}: {:.1}MB / {:.1}MB ({})",
                        self.model,
                        snapshot.downloaded_bytes as f64 / BYTES_PER_MB,
                        total as f64 / BYTES_PER_MB,
                        report
                    ),
                    _ => format!("Downloading {}...", self.model),
                };
                self.notifier.send(SessionNotification::Progress {
                    model: self.model.clone(),
                    downloaded_bytes: snapshot.downloaded_bytes,
                    total_bytes: snapshot.total_bytes,
                    percentage: snapshot.percentage(),
                    speed: report,
                    message,
                });
            }
            ProgressEvent::Succeeded => {
                if transition.is_some() {
                    self.after_success(&snapshot);
                }
            }
            ProgressEvent::Failed { reason } => {
                if transition.is_some() {
                    warn!("守护进程报告安装失败: {}, 原因: {}", self.model, reason);
                    self.notifier.send(SessionNotification::Failed {
                        model: self.model.clone(),
                        error: reason,
                    });
                }
            }
            _ => {}
        }
        terminal
    }

    /// 回退到命令行安装器；执行期间不观察取消令牌
    async fn run_fallback(&self, cause: InstallError) {
        if self.cancel.is_cancelled() {
            self.finish_cancelled();
            return;
        }

        info!("主通道不可用，切换到命令行安装器: {}, 原因: {}", self.model, cause);
        self.session.write().mark_fallback();
        self.notifier.send(SessionNotification::FallbackActivated {
            model: self.model.clone(),
            reason: FALLBACK_REASON.to_string(),
        });

        match self.transport.run_fallback(&self.model).await {
            Ok(()) => {
                let (transition, snapshot) = {
                    let mut session = self.session.write();
                    let transition = session.mark_succeeded();
                    (transition, session.clone())
                };
                if let Some(transition) = transition {
                    self.notify_transition(transition);
                    self.after_success(&snapshot);
                }
            }
            Err(e) => self.finish_failed(InstallError::from(e).reason()),
        }
    }

    fn after_success(&self, snapshot: &DownloadSession) {
        info!("✓ 模型安装完成: {} (通道: {:?})", self.model, snapshot.transport);
        self.notifier.send(SessionNotification::Completed {
            model: self.model.clone(),
            transport: snapshot.transport,
            completed_at: snapshot
                .finished_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        });
        VerificationProbe::new(self.catalog.clone(), self.notifier.clone())
            .spawn(self.model.clone());
    }

    fn finish_failed(&self, reason: String) {
        let transition = self.session.write().mark_failed(reason.clone());
        if let Some(transition) = transition {
            self.notify_transition(transition);
            self.notifier.send(SessionNotification::Failed {
                model: self.model.clone(),
                error: reason,
            });
        }
    }

    fn finish_cancelled(&self) {
        let transition = self.session.write().mark_cancelled();
        if let Some(transition) = transition {
            info!("已取消安装: {}", self.model);
            self.notify_transition(transition);
            self.notifier.send(SessionNotification::Cancelled {
                model: self.model.clone(),
            });
        }
    }

    fn finish_stalled(&self, idle: Duration) {
        let transition = {
            let mut session = self.session.write();
            // 与取消请求竞争时以取消为准
            if session.cancel_requested {
                drop(session);
                self.finish_cancelled();
                return;
            }
            session.mark_stalled()
        };

        if let Some(transition) = transition {
            let message = InstallError::Stalled { idle }.to_string();
            warn!("⚠️ 安装停滞: {}, {}", self.model, message);
            self.notify_transition(transition);
            self.notifier.send(SessionNotification::Stalled {
                model: self.model.clone(),
                idle_secs: idle.as_secs(),
                message,
            });
        }
    }

    fn notify_transition(&self, transition: Transition) {
        debug!(
            "会话状态变更: {} {} -> {}",
            self.model, transition.from, transition.to
        );
        self.notifier.send(SessionNotification::StatusChanged {
            model: self.model.clone(),
            old_status: transition.from,
            new_status: transition.to,
        });
    }
}

impl std::fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorker")
            .field("model", &self.model)
            .field("stall_timeout", &self.stall_timeout)
            .finish_non_exhaustive()
    }
}
