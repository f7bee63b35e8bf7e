//! 会话注册表
//!
//! 以模型标识为键保存会话槽位，同一模型同时只允许一个活跃会话，
//! 不同模型的会话可以并行。

use crate::config::{AppConfig, PullConfig};
use crate::daemon::{DaemonClient, ModelCatalog};
use crate::installer::{
    CliInstaller, DownloadSession, FallbackInstaller, ModelId, Notifier, SessionError,
    SessionNotification, SessionState, SessionWorker, TransportStrategy,
};
use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会话槽位
struct SessionSlot {
    session: Arc<RwLock<DownloadSession>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

/// 会话注册表
pub struct SessionRegistry {
    slots: DashMap<ModelId, SessionSlot>,
    transport: TransportStrategy,
    catalog: Arc<dyn ModelCatalog>,
    notifier: Notifier,
    config: PullConfig,
}

impl SessionRegistry {
    pub fn new(
        config: PullConfig,
        transport: TransportStrategy,
        catalog: Arc<dyn ModelCatalog>,
        notifier: Notifier,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            transport,
            catalog,
            notifier,
            config,
        }
    }

    /// 按应用配置组装：守护进程客户端作为主通道和目录，命令行安装器作为回退
    pub fn from_config(config: &AppConfig, notifier: Notifier) -> Result<Self> {
        let client = Arc::new(DaemonClient::new(&config.daemon, &config.pull)?);
        let fallback: Option<Arc<dyn FallbackInstaller>> = if config.pull.fallback_enabled {
            Some(Arc::new(CliInstaller::from_config(&config.pull)))
        } else {
            info!("命令行回退已禁用");
            None
        };

        let transport = TransportStrategy::new(client.clone(), fallback);
        Ok(Self::new(config.pull.clone(), transport, client, notifier))
    }

    /// 启动会话
    ///
    /// 已有活跃会话时返回 `AlreadySessionActive`；否则替换槽位并派生工作任务
    pub fn start(&self, id: ModelId) -> Result<(), SessionError> {
        match self.slots.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get().session.read().state;
                if state.is_active() {
                    debug!("会话已在进行中: {} ({})", id, state);
                    return Err(SessionError::AlreadySessionActive(id));
                }
                entry.insert(self.launch(id));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.launch(id));
            }
        }
        Ok(())
    }

    fn launch(&self, id: ModelId) -> SessionSlot {
        let mut session = DownloadSession::new(id.clone());
        let transition = session.begin();
        let run_id = session.run_id.clone();
        let session = Arc::new(RwLock::new(session));
        let cancel = CancellationToken::new();

        info!("登记安装会话: {} (run_id={})", id, run_id);
        self.notifier.send(SessionNotification::Preparing {
            model: id.clone(),
            run_id,
        });
        self.notifier.send(SessionNotification::StatusChanged {
            model: id,
            old_status: transition.from,
            new_status: transition.to,
        });

        let worker = SessionWorker::new(
            session.clone(),
            self.transport.clone(),
            self.catalog.clone(),
            self.notifier.clone(),
            cancel.clone(),
            &self.config,
        );
        let handle = tokio::spawn(worker.run());

        SessionSlot {
            session,
            cancel,
            worker: Some(handle),
        }
    }

    /// 取消会话
    ///
    /// 未知、空闲或已终结的会话为空操作；停滞会话没有工作任务，直接进入 Cancelled
    pub fn cancel(&self, id: &ModelId) {
        let Some(slot) = self.slots.get(id) else {
            debug!("取消请求忽略，会话不存在: {}", id);
            return;
        };

        let mut session = slot.session.write();
        if session.state == SessionState::Stalled {
            session.cancel_requested = true;
            if let Some(transition) = session.mark_cancelled() {
                drop(session);
                info!("已取消停滞会话: {}", id);
                self.notifier.send(SessionNotification::StatusChanged {
                    model: id.clone(),
                    old_status: transition.from,
                    new_status: transition.to,
                });
                self.notifier.send(SessionNotification::Cancelled { model: id.clone() });
            }
            return;
        }

        if !session.request_cancel() {
            debug!("取消请求忽略: {} ({})", id, session.state);
            return;
        }
        drop(session);

        info!("请求取消会话: {}", id);
        slot.cancel.cancel();
    }

    /// 恢复已取消或停滞的会话，字节计数重新开始
    pub fn resume(&self, id: &ModelId) -> Result<(), SessionError> {
        let resumable = self
            .slots
            .get(id)
            .map(|slot| slot.session.read().state.is_resumable())
            .unwrap_or(false);
        if !resumable {
            return Err(SessionError::NoCancelledSession(id.clone()));
        }

        self.start(id.clone())?;
        self.notifier
            .status(id, format!("Resuming download of {}...", id));
        Ok(())
    }

    /// 会话快照
    pub fn snapshot(&self, id: &ModelId) -> Option<DownloadSession> {
        self.slots.get(id).map(|slot| slot.session.read().clone())
    }

    /// 全部会话快照，按模型标识排序
    pub fn sessions(&self) -> Vec<DownloadSession> {
        let mut sessions: Vec<DownloadSession> = self
            .slots
            .iter()
            .map(|slot| slot.session.read().clone())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// 等待当前工作任务退出
    pub async fn wait(&self, id: &ModelId) {
        let handle = self
            .slots
            .get_mut(id)
            .and_then(|mut slot| slot.worker.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("会话工作任务异常退出: {}, 错误: {}", id, e);
            }
        }
    }

    /// 取消所有活跃会话并等待工作任务退出
    pub async fn shutdown(&self) {
        let ids: Vec<ModelId> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        for id in &ids {
            self.cancel(id);
        }
        for id in &ids {
            self.wait(id).await;
        }
        info!("会话注册表已关闭: {} 个会话", ids.len());
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.slots.len())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
