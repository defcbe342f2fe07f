use thiserror::Error;

/// 核心错误分类。
///
/// 分发管线的失败按条目/按仓库降级（坏仓库不拖垮整体列表）；
/// 校验和不匹配是安装/更新的硬失败，绝不静默接受。
#[derive(Debug, Error)]
pub enum PluginError {
    /// 下载内容与仓库条目声明的 SHA-256 不一致
    #[error("plugin checksum mismatch (expected={expected} actual={actual})")]
    ChecksumMismatch { expected: String, actual: String },

    /// 已安装插件缺少脚本主体（存储损坏或未完成安装）
    #[error("plugin script not found: {0}")]
    ScriptNotFound(String),

    /// 仓库索引中的单个条目缺少必填字段
    #[error("invalid repo entry #{index}: {reason}")]
    EntryInvalid { index: usize, reason: String },

    /// 整份仓库索引文档无法解析
    #[error("failed to parse repo index: {0}")]
    IndexParse(String),

    #[error("network request failed: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// 脚本编译/执行失败（含缺失必需入口函数）
    #[error("script error: {0}")]
    Script(String),

    /// 脚本对未落定的 Promise 取值（沙箱契约违反）
    #[error("asynchronous result not supported")]
    AsyncUnsupported,
}

impl PluginError {
    pub fn network(e: impl std::fmt::Display) -> Self {
        PluginError::Network(e.to_string())
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        PluginError::Storage(e.to_string())
    }
}
