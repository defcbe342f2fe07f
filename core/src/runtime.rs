//! 运行时抽象层：提供事件发送功能，不依赖任何 UI 框架。
//!
//! 分发管线与沙箱通过 [`EventEmitter`] 上报日志/状态，
//! 前端应用可注入自己的实现；无 UI 场景（CLI/测试）使用 [`NoopEmitter`]。

use std::sync::Arc;

/// 事件发送器 trait：抽象事件发送功能
pub trait EventEmitter: Send + Sync {
    /// 发送插件日志事件（脚本 print/debug、桥接函数告警等）
    fn emit_plugin_log(&self, plugin_id: &str, level: &str, message: &str);

    /// 发送下载状态事件
    fn emit_download_state(&self, plugin_id: &str, url: &str, state: &str, error: Option<&str>);

    /// 发送通用事件（用于扩展）
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// 空实现：直接打印到 stderr，用于 CLI/测试或不需要事件转发的场景
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit_plugin_log(&self, plugin_id: &str, level: &str, message: &str) {
        eprintln!("[plugin-log] {} [{}] {}", plugin_id, level, message);
    }

    fn emit_download_state(&self, plugin_id: &str, url: &str, state: &str, error: Option<&str>) {
        if let Some(err) = error {
            eprintln!("[download-state] {} [{}] {}: {}", plugin_id, state, url, err);
        } else {
            eprintln!("[download-state] {} [{}] {}", plugin_id, state, url);
        }
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        eprintln!("[event] {}: {}", event, payload);
    }
}

/// 共享发送器的便捷构造
pub fn noop_emitter() -> Arc<dyn EventEmitter> {
    Arc::new(NoopEmitter)
}
