//! Yomu 后端核心库入口（供 CLI 与上层阅读界面复用）。
//!
//! 核心职责：
//! - `plugin`：插件分发管线（仓库索引解析、校验和验证、下载/安装/更新）与运行时覆写
//! - `sandbox`：Rhai 脚本沙箱（模块加载、即时 Promise、原生能力桥）
//! - `dom`：句柄式 DOM 存储（沙箱 DOM 查询的后端）
//! - `source`：对外的 Source 能力面（搜索/解析）与结果规整、过滤器映射

pub mod app_paths;
pub mod dom;
pub mod error;
pub mod plugin;
pub mod runtime;
pub mod sandbox;
pub mod source;

pub use error::PluginError;
