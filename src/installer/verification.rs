//! 安装后校验
//!
//! 成功后在独立任务中查询已安装列表，只发出建议性通知，不改变会话终态

use crate::daemon::ModelCatalog;
use crate::installer::{ModelId, Notifier, SessionNotification};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// 已安装列表中存在同家族模型
    Verified,
    /// 列表中没有匹配项
    Mismatch,
    /// 查询失败
    Error { reason: String },
}

/// 校验探针
#[derive(Clone)]
pub struct VerificationProbe {
    catalog: Arc<dyn ModelCatalog>,
    notifier: Notifier,
}

impl VerificationProbe {
    pub fn new(catalog: Arc<dyn ModelCatalog>, notifier: Notifier) -> Self {
        Self { catalog, notifier }
    }

    /// 执行一次校验
    pub async fn check(&self, model: &ModelId) -> VerificationOutcome {
        let family = model.family();
        match self.catalog.list_installed().await {
            Ok(installed) => {
                if installed.iter().any(|a| a.name.starts_with(family)) {
                    info!("✓ 安装校验通过: {}", model);
                    VerificationOutcome::Verified
                } else {
                    warn!(
                        "安装校验未找到匹配模型: {} (已安装 {} 个)",
                        model,
                        installed.len()
                    );
                    VerificationOutcome::Mismatch
                }
            }
            Err(e) => {
                warn!("安装校验查询失败: {}, 错误: {:#}", model, e);
                VerificationOutcome::Error {
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    /// 在后台执行校验，结果通过通知投递
    pub fn spawn(self, model: ModelId) -> JoinHandle<()> {
        tokio::spawn(async move {
            let outcome = self.check(&model).await;
            self.notifier
                .send(SessionNotification::Verification { model, outcome });
        })
    }
}

impl std::fmt::Debug for VerificationProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationProbe").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::ArtifactDescriptor;
    use async_trait::async_trait;

    struct FixedCatalog(anyhow::Result<Vec<&'static str>>);

    #[async_trait]
    impl ModelCatalog for FixedCatalog {
        async fn list_installed(&self) -> anyhow::Result<Vec<ArtifactDescriptor>> {
            match &self.0 {
                Ok(names) => Ok(names
                    .iter()
                    .map(|name| ArtifactDescriptor {
                        name: name.to_string(),
                        size_bytes: 0,
                        modified_at: String::new(),
                        digest: String::new(),
                        format: String::new(),
                        family: String::new(),
                        param_size: String::new(),
                        quantization: String::new(),
                    })
                    .collect()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }

        async fn delete_model(&self, _model: &ModelId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn probe(catalog: FixedCatalog) -> (VerificationProbe, crate::installer::NotificationReceiver) {
        let (notifier, rx) = Notifier::channel();
        (VerificationProbe::new(Arc::new(catalog), notifier), rx)
    }

    #[tokio::test]
    async fn test_family_prefix_match() {
        let (probe, _rx) = probe(FixedCatalog(Ok(vec!["llama3.2:latest", "phi3:mini"])));
        assert_eq!(
            probe.check(&ModelId::from("llama3.2:3b")).await,
            VerificationOutcome::Verified
        );
        assert_eq!(
            probe.check(&ModelId::from("mistral")).await,
            VerificationOutcome::Mismatch
        );
    }

    #[tokio::test]
    async fn test_catalog_error() {
        let (probe, _rx) = probe(FixedCatalog(Err(anyhow::anyhow!("connection refused"))));
        match probe.check(&ModelId::from("phi3")).await {
            VerificationOutcome::Error { reason } => assert!(reason.contains("connection refused")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_emits_single_notification() {
        let (probe, mut rx) = probe(FixedCatalog(Ok(vec!["phi3:mini"])));
        probe.spawn(ModelId::from("phi3:mini")).await.unwrap();

        match rx.recv().await {
            Some(SessionNotification::Verification { model, outcome }) => {
                assert_eq!(model.as_str(), "phi3:mini");
                assert_eq!(outcome, VerificationOutcome::Verified);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
