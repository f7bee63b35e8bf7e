// 守护进程客户端实现

use crate::config::{DaemonConfig, PullConfig};
use crate::daemon::{ArtifactDescriptor, ModelCatalog, ModelNameRequest, TagsResponse};
use crate::installer::{InstallError, LineStream, ModelId, PullSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use std::io;
use std::time::Duration;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// 拉取流单行最大字节数，超出视为流错误
pub const MAX_PULL_LINE_BYTES: usize = 1024 * 1024;

/// 守护进程客户端
///
/// 提供已安装列表、删除和流式拉取三个接口
#[derive(Debug, Clone)]
pub struct DaemonClient {
    /// HTTP客户端（不设全局超时，流式拉取可能持续很久）
    client: Client,
    /// 基础地址（不含末尾 `/`）
    base_url: String,
    /// 守护进程配置
    config: DaemonConfig,
    /// 拉取请求建立连接的超时
    connect_timeout: Duration,
}

impl DaemonClient {
    /// 创建新的客户端
    pub fn new(daemon: &DaemonConfig, pull: &PullConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = daemon.base_url.trim_end_matches('/').to_string();
        info!("初始化守护进程客户端: {}", base_url);

        Ok(Self {
            client,
            base_url,
            config: daemon.clone(),
            connect_timeout: pull.connect_timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 可达性探测：`GET /api/tags`
    ///
    /// 请求失败视为连接错误，非成功状态码视为协议错误
    pub async fn probe(&self) -> Result<(), InstallError> {
        let resp = self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(self.config.probe_timeout())
            .send()
            .await
            .map_err(|e| InstallError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InstallError::Protocol {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// 打开流式拉取：`POST /api/pull`
    pub async fn pull_stream(&self, model: &ModelId) -> Result<LineStream, InstallError> {
        self.probe().await?;
        debug!("守护进程可达，开始拉取: {}", model);

        let request = self
            .client
            .post(self.endpoint("/api/pull"))
            .json(&ModelNameRequest {
                name: model.as_str(),
            })
            .send();

        let resp = match tokio::time::timeout(self.connect_timeout, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(InstallError::Connection(e.to_string())),
            Err(_) => {
                return Err(InstallError::Connection(format!(
                    "no response within {} seconds",
                    self.connect_timeout.as_secs()
                )))
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("拉取请求被拒绝: {}, HTTP {}, {}", model, status, body.trim());
            return Err(InstallError::Protocol {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                MAX_PULL_LINE_BYTES,
            ),
        )
        .map(|item| {
            item.map(|line| String::from_utf8_lossy(&line).into_owned())
                .map_err(|e| InstallError::Stream(e.to_string()))
        });

        Ok(lines.boxed())
    }

    /// 查询已安装模型：`GET /api/tags`
    pub async fn list_installed(&self) -> Result<Vec<ArtifactDescriptor>> {
        let resp = self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(self.config.list_timeout())
            .send()
            .await
            .context("无法连接守护进程")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("查询已安装模型失败: HTTP {}: {}", status, body.trim());
        }

        let tags: TagsResponse = resp.json().await.context("解析已安装模型列表失败")?;
        let models: Vec<ArtifactDescriptor> = tags.models.into_iter().map(Into::into).collect();
        debug!("已安装模型数量: {}", models.len());
        Ok(models)
    }

    /// 删除模型：`DELETE /api/delete`
    pub async fn delete_model(&self, model: &ModelId) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint("/api/delete"))
            .json(&ModelNameRequest {
                name: model.as_str(),
            })
            .timeout(self.config.delete_timeout())
            .send()
            .await
            .context("无法连接守护进程")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("删除模型失败: {}", body.trim());
        }

        info!("✓ 已删除模型: {}", model);
        Ok(())
    }
}

#[async_trait]
impl PullSource for DaemonClient {
    async fn open_pull(&self, model: &ModelId) -> Result<LineStream, InstallError> {
        self.pull_stream(model).await
    }
}

#[async_trait]
impl ModelCatalog for DaemonClient {
    async fn list_installed(&self) -> Result<Vec<ArtifactDescriptor>> {
        DaemonClient::list_installed(self).await
    }

    async fn delete_model(&self, model: &ModelId) -> Result<()> {
        DaemonClient::delete_model(self, model).await
    }
}
