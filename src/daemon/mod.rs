// 本地模型守护进程接入模块

pub mod client;
pub mod types;

pub use client::DaemonClient;
pub use types::{ArtifactDescriptor, InstalledModel, ModelDetails, ModelNameRequest, TagsResponse};

use crate::installer::ModelId;
use anyhow::Result;
use async_trait::async_trait;

/// 已安装模型目录
///
/// 安装后校验和命令行的 `list` / `rm` 都通过该接口访问守护进程
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// 查询已安装模型
    async fn list_installed(&self) -> Result<Vec<ArtifactDescriptor>>;

    /// 删除模型
    async fn delete_model(&self, model: &ModelId) -> Result<()>;
}
