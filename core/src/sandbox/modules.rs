//! 模块加载器：插件脚本与其依赖在稳定模块名下注册。
//!
//! 小型标准库（状态常量/字符串清洗/HTML 助手）以 Rhai 源码形式随沙箱
//! 编译，插件内部的多文件依赖走同一条注册路径，互不污染全局命名空间。

use rhai::{Engine, Module, Scope, Shared};

use crate::error::PluginError;

/// 书目连载状态常量
const STATUS_MODULE: &str = r#"
export const UNKNOWN = "Unknown";
export const ONGOING = "Ongoing";
export const COMPLETED = "Completed";
export const ON_HIATUS = "On Hiatus";
export const CANCELLED = "Cancelled";
export const LICENSED = "Licensed";
"#;

const STRINGS_MODULE: &str = r#"
// 折叠连续空白并去掉首尾空白
fn squeeze_ws(s) {
    let out = s;
    out.replace("\t", " ");
    out.replace("\n", " ");
    out.replace("\r", " ");
    while out.contains("  ") {
        out.replace("  ", " ");
    }
    out.trim();
    out
}

// 取末尾连续数字，没有则返回空串
fn trailing_digits(s) {
    let out = "";
    let i = s.len - 1;
    while i >= 0 {
        let ch = s[i];
        if ch >= '0' && ch <= '9' {
            out = ch.to_string() + out;
            i -= 1;
        } else {
            break;
        }
    }
    out
}
"#;

const HTML_MODULE: &str = r#"
// 常见实体反转义。&amp; 最后处理，避免二次展开
fn decode_entities(s) {
    let out = s;
    out.replace("&lt;", "<");
    out.replace("&gt;", ">");
    out.replace("&quot;", "\"");
    out.replace("&#39;", "'");
    out.replace("&nbsp;", " ");
    out.replace("&amp;", "&");
    out
}
"#;

/// 编译后的模块表，按稳定名字注册到 Engine
pub struct ModuleRegistry {
    modules: Vec<(String, Shared<Module>)>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// 标准库：status / strings / html
    pub fn with_std(engine: &Engine) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        registry.register_source(engine, "status", STATUS_MODULE)?;
        registry.register_source(engine, "strings", STRINGS_MODULE)?;
        registry.register_source(engine, "html", HTML_MODULE)?;
        Ok(registry)
    }

    /// 把一段 Rhai 源码编译为模块并登记到 `name` 之下
    pub fn register_source(
        &mut self,
        engine: &Engine,
        name: &str,
        source: &str,
    ) -> Result<(), PluginError> {
        let ast = engine
            .compile(source)
            .map_err(|e| PluginError::Script(format!("module '{}' compile error: {}", name, e)))?;
        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(|e| PluginError::Script(format!("module '{}' eval error: {}", name, e)))?;
        self.modules.push((name.to_string(), Shared::new(module)));
        Ok(())
    }

    pub fn apply(&self, engine: &mut Engine) {
        for (name, module) in &self.modules {
            engine.register_static_module(name, module.clone());
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 插件脚本的模块定义外壳：固定模块身份头后交给编译器。
/// 插件级常量（PLUGIN_ID/SITE）由运行时经 Scope 注入，不在这里拼接。
pub struct ScriptEnvelope;

impl ScriptEnvelope {
    pub fn wrap(module_name: &str, script: &str) -> String {
        format!("// module: {module_name}\n{script}\n")
    }
}
