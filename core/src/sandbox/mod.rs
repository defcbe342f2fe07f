//! 脚本执行沙箱：每个插件源一个实例。
//!
//! 单线程协作模型：所有原生桥调用从脚本视角同步完成，Promise 垫片的
//! “立即落定”设计使脚本内不存在真正的挂起点。调用方应在后台执行上下文
//! 中驱动插件操作（网络请求会阻塞当前线程），并对同一实例串行调用。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::{Array, Dynamic, Engine, EvalAltResult, FuncArgs, Map, Position, Scope, AST};

use crate::dom::DomStore;
use crate::error::PluginError;
use crate::plugin::kv::PluginKeyValueStore;
use crate::plugin::overrides::RuntimeOverride;
use crate::runtime::EventEmitter;

pub mod bridge;
pub mod modules;
pub mod promise;
pub mod proto;

pub use modules::{ModuleRegistry, ScriptEnvelope};
pub use promise::ImmediatePromise;

use bridge::BridgeContext;

/// 沙箱构造参数。`script` 应是已应用覆写补丁后的源文本。
pub struct SandboxConfig {
    pub plugin_id: String,
    pub script: String,
    /// 插件条目声明的站点地址，注入为脚本常量 `SITE`
    pub site: String,
    pub override_entry: RuntimeOverride,
    pub kv: Arc<PluginKeyValueStore>,
    pub emitter: Arc<dyn EventEmitter>,
    /// 插件内部依赖文件：(模块名, Rhai 源码)
    pub extra_modules: Vec<(String, String)>,
    pub http_timeout: Duration,
}

/// 一个插件脚本实例：Engine + 编译后的 AST + 专属 DOM 存储。
///
/// 不在内部加锁：模型假设每个源单飞使用，调用方负责串行化。
pub struct PluginRuntime {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    plugin_id: String,
    dom: Arc<Mutex<DomStore>>,
}

impl PluginRuntime {
    pub fn new(cfg: SandboxConfig) -> Result<Self, PluginError> {
        let mut engine = Engine::new();

        // 不受信脚本的资源上限
        engine.set_max_operations(5_000_000);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(5 * 1024 * 1024);
        engine.set_max_array_size(131_072);
        engine.set_max_map_size(16_384);

        // 脚本 print/debug 走事件发送器
        {
            let emitter = Arc::clone(&cfg.emitter);
            let plugin_id = cfg.plugin_id.clone();
            engine.on_print(move |s: &str| {
                emitter.emit_plugin_log(&plugin_id, "print", s);
            });
        }
        {
            let emitter = Arc::clone(&cfg.emitter);
            let plugin_id = cfg.plugin_id.clone();
            engine.on_debug(move |s: &str, src: Option<&str>, pos: Position| {
                let src = src.unwrap_or("unknown");
                emitter.emit_plugin_log(&plugin_id, "debug", &format!("{src} @ {pos:?} > {s}"));
            });
        }

        // 标准库模块 + 插件内部依赖模块
        let mut registry = ModuleRegistry::with_std(&engine)?;
        for (name, source) in &cfg.extra_modules {
            registry.register_source(&engine, name, source)?;
        }
        registry.apply(&mut engine);

        promise::register(&mut engine);

        let dom = Arc::new(Mutex::new(DomStore::new()));
        bridge::register_bridge(
            &mut engine,
            &BridgeContext {
                plugin_id: cfg.plugin_id.clone(),
                override_entry: Arc::new(cfg.override_entry),
                dom: Arc::clone(&dom),
                kv: Arc::clone(&cfg.kv),
                emitter: Arc::clone(&cfg.emitter),
                http_timeout: cfg.http_timeout,
            },
        );

        // 注入插件级常量。脚本函数体读不到 Scope 里的普通变量，但常量会在
        // 编译期传播进函数体，所以统一用 push_constant + compile_with_scope。
        let mut scope = Scope::new();
        scope.push_constant("PLUGIN_ID", cfg.plugin_id.clone());
        scope.push_constant("SITE", cfg.site.clone());

        let wrapped = ScriptEnvelope::wrap(&cfg.plugin_id, &cfg.script);
        let ast = engine
            .compile_with_scope(&scope, &wrapped)
            .map_err(|e| PluginError::Script(format!("compile error: {}", e)))?;

        Ok(Self {
            engine,
            ast,
            scope,
            plugin_id: cfg.plugin_id,
            dom,
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn dom(&self) -> Arc<Mutex<DomStore>> {
        Arc::clone(&self.dom)
    }

    /// 脚本是否定义了某个入口函数
    pub fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    /// 同步调用脚本函数
    pub fn call(&mut self, name: &str, args: impl FuncArgs) -> Result<Dynamic, PluginError> {
        self.engine
            .call_fn::<Dynamic>(&mut self.scope, &self.ast, name, args)
            .map_err(|e| map_eval_error(&self.plugin_id, name, &e))
    }
}

fn map_eval_error(plugin_id: &str, fn_name: &str, e: &EvalAltResult) -> PluginError {
    let text = e.to_string();
    if text.contains(promise::ASYNC_UNSUPPORTED_MSG) {
        return PluginError::AsyncUnsupported;
    }
    if let EvalAltResult::ErrorFunctionNotFound(name, _) = e {
        if name.starts_with(fn_name) {
            return PluginError::Script(format!(
                "plugin '{}' does not define function '{}'",
                plugin_id, fn_name
            ));
        }
    }
    let pos = e.position();
    match (pos.line(), pos.position()) {
        (Some(line), Some(col)) => PluginError::Script(format!(
            "plugin '{}' fn '{}' failed at {}:{}: {}",
            plugin_id, fn_name, line, col, text
        )),
        _ => PluginError::Script(format!("plugin '{}' fn '{}' failed: {}", plugin_id, fn_name, text)),
    }
}

// ------------------------------------------------------------------
// Dynamic <-> JSON（桥与 Source 层共用）
// ------------------------------------------------------------------

pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if value.is_string() {
        return serde_json::Value::String(
            value.clone().into_string().unwrap_or_default(),
        );
    }
    if value.is_array() {
        let array = value.clone().try_cast::<Array>().unwrap_or_default();
        return serde_json::Value::Array(array.iter().map(dynamic_to_json).collect());
    }
    if value.is_map() {
        let map = value.clone().try_cast::<Map>().unwrap_or_default();
        let mut obj = serde_json::Map::new();
        for (k, v) in map.iter() {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        return serde_json::Value::Object(obj);
    }
    serde_json::Value::String(value.to_string())
}

pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(u) = n.as_u64() {
                Dynamic::from(u as i64)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(arr) => {
            let array: Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        serde_json::Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.clone().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NoopEmitter;

    fn runtime_with(script: &str) -> (tempfile::TempDir, PluginRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = PluginRuntime::new(SandboxConfig {
            plugin_id: "demo".to_string(),
            script: script.to_string(),
            site: "https://demo.example".to_string(),
            override_entry: RuntimeOverride::empty("demo"),
            kv: Arc::new(PluginKeyValueStore::new(dir.path())),
            emitter: Arc::new(NoopEmitter),
            extra_modules: Vec::new(),
            http_timeout: Duration::from_secs(5),
        })
        .unwrap();
        (dir, runtime)
    }

    #[test]
    fn test_promise_then_chain_runs_synchronously() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn chain() {
                let p = promise_resolve(1).then(|v| v + 1).then(|v| v * 10);
                await_now(p)
            }
            "#,
        );
        let out = rt.call("chain", ()).unwrap();
        assert_eq!(out.as_int().unwrap(), 20);
    }

    #[test]
    fn test_promise_catch_recovers_rejection() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn recover() {
                let p = promise_reject("boom").catch(|e| "caught:" + e);
                await_now(p)
            }
            fn all() {
                await_now(promise_all([promise_resolve(1), 2, promise_resolve(3)]))
            }
            "#,
        );
        let out = rt.call("recover", ()).unwrap();
        assert_eq!(out.into_string().unwrap(), "caught:boom");

        let all = rt.call("all", ()).unwrap();
        let arr = all.try_cast::<Array>().unwrap();
        assert_eq!(arr.len(), 3);
    }

    #[test]
    fn test_awaiting_pending_promise_is_contract_violation() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn bad() { await_now(promise_pending()) }
            "#,
        );
        let err = rt.call("bad", ()).unwrap_err();
        assert!(matches!(err, PluginError::AsyncUnsupported));
    }

    #[test]
    fn test_std_modules_and_plugin_constants() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn st() { status::ONGOING }
            fn clean(s) { strings::squeeze_ws(s) }
            fn ent(s) { html::decode_entities(s) }
            fn whoami() { PLUGIN_ID + "@" + SITE }
            "#,
        );
        assert_eq!(rt.call("st", ()).unwrap().into_string().unwrap(), "Ongoing");
        assert_eq!(
            rt.call("clean", (" a \n b ".to_string(),))
                .unwrap()
                .into_string()
                .unwrap(),
            "a b"
        );
        assert_eq!(
            rt.call("ent", ("&lt;b&gt;&amp;amp;".to_string(),))
                .unwrap()
                .into_string()
                .unwrap(),
            "<b>&amp;"
        );
        assert_eq!(
            rt.call("whoami", ()).unwrap().into_string().unwrap(),
            "demo@https://demo.example"
        );
    }

    #[test]
    fn test_extra_module_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = PluginRuntime::new(SandboxConfig {
            plugin_id: "demo".to_string(),
            script: "fn np(p) { pager::next_page(p) }".to_string(),
            site: String::new(),
            override_entry: RuntimeOverride::empty("demo"),
            kv: Arc::new(PluginKeyValueStore::new(dir.path())),
            emitter: Arc::new(NoopEmitter),
            extra_modules: vec![(
                "pager".to_string(),
                "fn next_page(p) { p + 1 }".to_string(),
            )],
            http_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(rt.call("np", (41_i64,)).unwrap().as_int().unwrap(), 42);
    }

    #[test]
    fn test_storage_bridge_scoped_to_plugin() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn roundtrip() {
                storage_set("k", "v");
                let v = storage_get("k");
                storage_remove("k");
                let gone = storage_get("k");
                if gone != () { return "remove failed" }
                v
            }
            "#,
        );
        assert_eq!(
            rt.call("roundtrip", ()).unwrap().into_string().unwrap(),
            "v"
        );
    }

    #[test]
    fn test_dom_bridge_end_to_end() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn titles(html) {
                let d = dom_load(html);
                let out = [];
                for h in dom_select(d, "h2.title") {
                    out.push(dom_text(h));
                }
                dom_release_all();
                out
            }
            fn missing_parent(html) {
                let d = dom_load(html);
                dom_parent(d)
            }
            "#,
        );
        let out = rt
            .call(
                "titles",
                ("<h2 class='title'>One</h2><h2 class='title'>Two</h2><h2>x</h2>".to_string(),),
            )
            .unwrap();
        let arr = out.try_cast::<Array>().unwrap();
        let titles: Vec<String> = arr
            .into_iter()
            .map(|d| d.into_string().unwrap())
            .collect();
        assert_eq!(titles, vec!["One", "Two"]);

        let parent = rt
            .call("missing_parent", ("<p>a</p>".to_string(),))
            .unwrap();
        assert_eq!(parent.as_int().unwrap(), -1);
    }

    #[test]
    fn test_url_bridge() {
        let (_dir, mut rt) = runtime_with(
            r#"
            fn r(u, b) { resolve_url(u, b) }
            fn p(u) { get_pathname(u) }
            "#,
        );
        assert_eq!(
            rt.call("r", ("/ch-2".to_string(), "https://a.com/novel/x".to_string()))
                .unwrap()
                .into_string()
                .unwrap(),
            "https://a.com/ch-2"
        );
        assert_eq!(
            rt.call("p", ("https://a.com/novel/x?q=1".to_string(),))
                .unwrap()
                .into_string()
                .unwrap(),
            "/novel/x"
        );
    }

    #[test]
    fn test_missing_function_is_script_error() {
        let (_dir, mut rt) = runtime_with("fn present() { 1 }");
        assert!(rt.has_function("present"));
        assert!(!rt.has_function("absent"));
        let err = rt.call("absent", ()).unwrap_err();
        assert!(matches!(err, PluginError::Script(_)));
    }

    #[test]
    fn test_dynamic_json_conversions() {
        let json = serde_json::json!({
            "s": "x", "i": 3, "f": 1.5, "b": true, "n": null,
            "arr": [1, "two"], "obj": { "k": "v" }
        });
        let roundtrip = dynamic_to_json(&json_to_dynamic(&json));
        assert_eq!(roundtrip, json);
    }
}
