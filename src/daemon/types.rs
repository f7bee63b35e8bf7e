// 守护进程 API 类型定义

use serde::{Deserialize, Serialize};

/// 已安装模型描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// 模型名（含 tag）
    pub name: String,
    /// 大小（字节）
    pub size_bytes: u64,
    /// 修改时间（守护进程原样返回的 RFC3339 字符串）
    pub modified_at: String,
    /// 摘要
    pub digest: String,
    /// 格式（如 gguf）
    pub format: String,
    /// 模型家族
    pub family: String,
    /// 参数规模（如 7B）
    pub param_size: String,
    /// 量化级别（如 Q4_0）
    pub quantization: String,
}

impl ArtifactDescriptor {
    /// 大小（MB）
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }

    /// 摘要前 16 个字符
    pub fn short_digest(&self) -> &str {
        let end = self
            .digest
            .char_indices()
            .nth(16)
            .map(|(i, _)| i)
            .unwrap_or(self.digest.len());
        &self.digest[..end]
    }
}

/// `GET /api/tags` 响应
#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<InstalledModel>,
}

/// 已安装模型（线上格式）
#[derive(Debug, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

/// 模型详情
#[derive(Debug, Default, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

impl From<InstalledModel> for ArtifactDescriptor {
    fn from(model: InstalledModel) -> Self {
        let details = model.details.unwrap_or_default();
        Self {
            name: model.name,
            size_bytes: model.size,
            modified_at: model.modified_at,
            digest: model.digest,
            format: details.format,
            family: details.family,
            param_size: details.parameter_size,
            quantization: details.quantization_level,
        }
    }
}

/// `POST /api/pull` 与 `DELETE /api/delete` 请求体
#[derive(Debug, Serialize)]
pub struct ModelNameRequest<'a> {
    pub name: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags_response() {
        let json = r#"{
            "models": [
                {
                    "name": "llama3.2:3b",
                    "size": 2019393189,
                    "modified_at": "2024-10-01T10:00:00.123456789-07:00",
                    "digest": "a80c4f17acd55265feec403c7aef86be0c25983ab279d83f3bcd3abbcb5b8b72",
                    "details": {
                        "format": "gguf",
                        "family": "llama",
                        "parameter_size": "3.2B",
                        "quantization_level": "Q4_K_M"
                    }
                },
                { "name": "bare-model" }
            ]
        }"#;

        let resp: TagsResponse = serde_json::from_str(json).unwrap();
        let models: Vec<ArtifactDescriptor> = resp.models.into_iter().map(Into::into).collect();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3.2:3b");
        assert_eq!(models[0].family, "llama");
        assert_eq!(models[0].param_size, "3.2B");
        assert_eq!(models[0].quantization, "Q4_K_M");
        assert_eq!(models[0].short_digest(), "a80c4f17acd55265");
        assert!((models[0].size_mb() - 1925.84).abs() < 0.01);

        assert_eq!(models[1].name, "bare-model");
        assert_eq!(models[1].size_bytes, 0);
        assert_eq!(models[1].family, "");
    }

    #[test]
    fn test_empty_tags_response() {
        let resp: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.models.is_empty());
    }
}
