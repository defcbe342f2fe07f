//! 原生能力桥：脚本与宿主之间唯一的通道。
//!
//! 网络、键值存储、DOM、URL、二进制协议解码都在这里注册。失败的桥调用
//! 向脚本返回带标记的失败值（status=0 + error 字段，或 rejected Promise），
//! 不抛出脚本无法捕获的宿主错误，插件逻辑保有兜底控制权。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as Base64Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rhai::{Array, Dynamic, Engine, Map};
use url::Url;

use crate::dom::DomStore;
use crate::plugin::download::create_blocking_client;
use crate::plugin::kv::PluginKeyValueStore;
use crate::plugin::overrides::{resolve_alias, RuntimeOverride};
use crate::runtime::EventEmitter;
use crate::sandbox::promise::ImmediatePromise;
use crate::sandbox::{json_to_dynamic, proto};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "*/*";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// DOM 桥的“未找到”句柄
const NOT_FOUND: i64 = -1;

pub struct BridgeContext {
    pub plugin_id: String,
    pub override_entry: Arc<RuntimeOverride>,
    pub dom: Arc<Mutex<DomStore>>,
    pub kv: Arc<PluginKeyValueStore>,
    pub emitter: Arc<dyn EventEmitter>,
    pub http_timeout: Duration,
}

fn lock_or_inner<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

fn map_str(map: &Map, key: &str) -> Option<String> {
    map.get(key)
        .filter(|d| d.is_string())
        .and_then(|d| d.clone().into_string().ok())
}

fn map_map(map: &Map, key: &str) -> Option<Map> {
    map.get(key).and_then(|d| d.clone().try_cast::<Map>())
}

/// 注册全部桥接函数（每个闭包持有自己的共享句柄）
pub fn register_bridge(engine: &mut Engine, ctx: &BridgeContext) {
    register_fetch(engine, ctx);
    register_fetch_proto(engine, ctx);
    register_storage(engine, ctx);
    register_url(engine, ctx);
    register_dom(engine, ctx);
}

// ------------------------------------------------------------------
// fetch
// ------------------------------------------------------------------

fn register_fetch(engine: &mut Engine, ctx: &BridgeContext) {
    let c = FetchContext::new(ctx);
    engine.register_fn("fetch", {
        let c = c.clone();
        move |url: &str| -> ImmediatePromise {
            ImmediatePromise::fulfilled(Dynamic::from(c.fetch(url, None)))
        }
    });
    let c2 = c.clone();
    engine.register_fn("fetch", move |url: &str, options: Map| -> ImmediatePromise {
        ImmediatePromise::fulfilled(Dynamic::from(c2.fetch(url, Some(options))))
    });
}

#[derive(Clone)]
struct FetchContext {
    plugin_id: String,
    override_entry: Arc<RuntimeOverride>,
    emitter: Arc<dyn EventEmitter>,
    timeout: Duration,
}

impl FetchContext {
    fn new(ctx: &BridgeContext) -> Self {
        Self {
            plugin_id: ctx.plugin_id.clone(),
            override_entry: Arc::clone(&ctx.override_entry),
            emitter: Arc::clone(&ctx.emitter),
            timeout: ctx.http_timeout,
        }
    }

    fn alias(&self, url: &str) -> String {
        resolve_alias(&self.override_entry, url)
    }

    fn warn(&self, message: String) {
        self.emitter.emit_plugin_log(&self.plugin_id, "warn", &message);
    }

    /// 同步取回；网络失败返回 `{status: 0, …, error}` 值
    fn fetch(&self, url: &str, options: Option<Map>) -> Map {
        let resolved_url = self.alias(url);
        match self.try_fetch(&resolved_url, options) {
            Ok(map) => map,
            Err(e) => failure_response(&resolved_url, &e),
        }
    }

    fn try_fetch(&self, resolved_url: &str, options: Option<Map>) -> Result<Map, String> {
        let options = options.unwrap_or_default();
        let client = create_blocking_client(self.timeout).map_err(|e| e.to_string())?;

        let method_name = map_str(&options, "method")
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|e| format!("Invalid method {}: {}", method_name, e))?;

        let mut present: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut header_map = HeaderMap::new();
        if let Some(headers) = map_map(&options, "headers") {
            for (name, value) in headers.iter() {
                let key = name.trim();
                if key.is_empty() {
                    continue;
                }
                let value_str = value.clone().into_string().unwrap_or_else(|_| value.to_string());
                // Referer/Origin 里出现旧域名时同样走别名改写
                let value_str = if key.eq_ignore_ascii_case("referer")
                    || key.eq_ignore_ascii_case("origin")
                {
                    self.alias(&value_str)
                } else {
                    value_str
                };
                let header_name = match HeaderName::from_bytes(key.as_bytes()) {
                    Ok(n) => n,
                    Err(e) => {
                        self.warn(format!("[headers] 跳过无效 header 名：{} ({})", key, e));
                        continue;
                    }
                };
                let header_value = match HeaderValue::from_str(&value_str) {
                    Ok(v) => v,
                    Err(e) => {
                        self.warn(format!("[headers] 跳过无效 header 值：{} ({})", key, e));
                        continue;
                    }
                };
                present.insert(key.to_lowercase());
                header_map.insert(header_name, header_value);
            }
        }
        self.add_default_headers(&mut header_map, &mut present, resolved_url, &method_name);

        let mut request = client.request(method.clone(), resolved_url).headers(header_map);

        let body_type = map_str(&options, "bodyType").unwrap_or_else(|| "none".to_string());
        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            match body_type.as_str() {
                "form" => {
                    let pairs: Vec<(String, String)> = map_map(&options, "form")
                        .map(|form| {
                            form.iter()
                                .map(|(k, v)| {
                                    let value = v
                                        .clone()
                                        .into_string()
                                        .unwrap_or_else(|_| v.to_string());
                                    (k.to_string(), value)
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    request = request.form(&pairs);
                }
                "text" => {
                    let body = map_str(&options, "body").unwrap_or_default();
                    if !present.contains("content-type") {
                        request =
                            request.header("Content-Type", "application/json; charset=utf-8");
                    }
                    request = request.body(body);
                }
                _ => {}
            }
        }

        let response = request.send().map_err(|e| e.to_string())?;
        let status = response.status().as_u16() as i64;
        let final_url = response.url().to_string();

        let mut joined: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            joined
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_str().unwrap_or("").to_string());
        }
        let mut headers_out = Map::new();
        for (name, values) in joined {
            headers_out.insert(name.into(), Dynamic::from(values.join(",")));
        }

        let bytes = response.bytes().map_err(|e| e.to_string())?;
        let mut out = Map::new();
        out.insert("status".into(), Dynamic::from(status));
        out.insert("url".into(), Dynamic::from(final_url));
        out.insert("headers".into(), Dynamic::from(headers_out));
        out.insert(
            "body".into(),
            Dynamic::from(String::from_utf8_lossy(&bytes).into_owned()),
        );
        out.insert(
            "bodyBase64".into(),
            Dynamic::from(BASE64_STANDARD.encode(&bytes)),
        );
        Ok(out)
    }

    fn add_default_headers(
        &self,
        headers: &mut HeaderMap,
        present: &mut std::collections::HashSet<String>,
        url: &str,
        method: &str,
    ) {
        let origin = Url::parse(url).ok().and_then(|u| {
            let host = u.host_str()?.to_string();
            let scheme = u.scheme().to_string();
            match u.port() {
                Some(port) => Some(format!("{}://{}:{}", scheme, host, port)),
                None => Some(format!("{}://{}", scheme, host)),
            }
        });

        let mut put = |name: &'static str, value: String, present: &mut std::collections::HashSet<String>| {
            if present.contains(name) {
                return;
            }
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), v);
                present.insert(name.to_string());
            }
        };

        put("user-agent", DEFAULT_USER_AGENT.to_string(), present);
        put("accept", DEFAULT_ACCEPT.to_string(), present);
        put("accept-language", DEFAULT_ACCEPT_LANGUAGE.to_string(), present);
        if let Some(origin) = origin {
            put("referer", format!("{}/", origin), present);
            if method != "GET" && method != "HEAD" {
                put("origin", origin, present);
            }
        }
    }
}

fn failure_response(url: &str, error: &str) -> Map {
    let mut out = Map::new();
    out.insert("status".into(), Dynamic::from(0_i64));
    out.insert("url".into(), Dynamic::from(url.to_string()));
    out.insert("headers".into(), Dynamic::from(Map::new()));
    out.insert("body".into(), Dynamic::from(error.to_string()));
    out.insert("error".into(), Dynamic::from(error.to_string()));
    out
}

// ------------------------------------------------------------------
// fetch_proto（gRPC-web）
// ------------------------------------------------------------------

fn register_fetch_proto(engine: &mut Engine, ctx: &BridgeContext) {
    let c = FetchContext::new(ctx);
    engine.register_fn("fetch_proto", {
        let c = c.clone();
        move |url: &str, config: Map| -> ImmediatePromise { fetch_proto_impl(&c, url, config, None) }
    });
    engine.register_fn(
        "fetch_proto",
        move |url: &str, config: Map, options: Map| -> ImmediatePromise {
            fetch_proto_impl(&c, url, config, Some(options))
        },
    );
}

fn fetch_proto_impl(
    ctx: &FetchContext,
    url: &str,
    config: Map,
    options: Option<Map>,
) -> ImmediatePromise {
    let resolved_url = ctx.alias(url);
    match try_fetch_proto(ctx, &resolved_url, &config, options) {
        Ok(value) => ImmediatePromise::fulfilled(json_to_dynamic(&value)),
        Err(e) => ImmediatePromise::rejected(Dynamic::from(e)),
    }
}

fn try_fetch_proto(
    ctx: &FetchContext,
    url: &str,
    config: &Map,
    options: Option<Map>,
) -> Result<serde_json::Value, String> {
    let request_type =
        map_str(config, "requestType").ok_or("fetch_proto: missing requestType")?;
    let response_type =
        map_str(config, "responseType").ok_or("fetch_proto: missing responseType")?;
    let request_data = config
        .get("requestData")
        .map(crate::sandbox::dynamic_to_json)
        .unwrap_or(serde_json::Value::Object(Default::default()));

    let payload = proto::encode_request(&request_type, &request_data)?;
    let framed = proto::frame_grpc_web_message(&payload);

    let client = create_blocking_client(ctx.timeout).map_err(|e| e.to_string())?;
    let mut request = client.post(url).body(framed);

    let mut present: std::collections::HashSet<String> = std::collections::HashSet::new();
    if let Some(options) = options {
        if let Some(headers) = map_map(&options, "headers") {
            for (name, value) in headers.iter() {
                let value_str = value.clone().into_string().unwrap_or_else(|_| value.to_string());
                present.insert(name.to_lowercase());
                request = request.header(name.as_str(), value_str);
            }
        }
    }
    for (name, value) in [
        ("content-type", "application/grpc-web+proto"),
        ("accept", "application/grpc-web+proto"),
        ("x-grpc-web", "1"),
        ("x-user-agent", "grpc-web-javascript/0.1"),
    ] {
        if !present.contains(name) {
            request = request.header(name, value);
        }
    }

    let response = request.send().map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("gRPC-web request failed: HTTP {}", response.status()));
    }
    let body = response.bytes().map_err(|e| e.to_string())?;
    let message = proto::extract_grpc_web_payload(&body);
    proto::decode_response(&response_type, &message)
}

// ------------------------------------------------------------------
// 键值存储（按插件 id 隔离）
// ------------------------------------------------------------------

fn register_storage(engine: &mut Engine, ctx: &BridgeContext) {
    let kv = Arc::clone(&ctx.kv);
    let id = ctx.plugin_id.clone();
    engine.register_fn("storage_get", move |key: &str| -> Dynamic {
        match kv.get(&id, key) {
            Some(v) => Dynamic::from(v),
            None => Dynamic::UNIT,
        }
    });

    let kv = Arc::clone(&ctx.kv);
    let id = ctx.plugin_id.clone();
    engine.register_fn("storage_set", move |key: &str, value: &str| {
        kv.set(&id, key, value);
    });

    let kv = Arc::clone(&ctx.kv);
    let id = ctx.plugin_id.clone();
    engine.register_fn("storage_remove", move |key: &str| {
        kv.remove(&id, key);
    });

    let kv = Arc::clone(&ctx.kv);
    let id = ctx.plugin_id.clone();
    engine.register_fn("storage_clear", move || {
        kv.clear(&id);
    });

    let kv = Arc::clone(&ctx.kv);
    let id = ctx.plugin_id.clone();
    engine.register_fn("storage_keys", move || -> Array {
        kv.keys(&id).into_iter().map(Dynamic::from).collect()
    });
}

// ------------------------------------------------------------------
// URL 工具
// ------------------------------------------------------------------

/// 相对 URL 解析；解析失败时原样返回输入
fn resolve_url_value(input: &str, base: &str) -> String {
    let input_value = input.trim();
    if let Ok(absolute) = Url::parse(input_value) {
        return absolute.to_string();
    }
    let base_value = base.trim();
    if base_value.is_empty() {
        return input_value.to_string();
    }
    match Url::parse(base_value).and_then(|b| b.join(input_value)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => input_value.to_string(),
    }
}

fn register_url(engine: &mut Engine, ctx: &BridgeContext) {
    let entry = Arc::clone(&ctx.override_entry);
    engine.register_fn("resolve_url", move |url: &str, base: &str| -> String {
        let aliased_base = resolve_alias(&entry, base);
        let resolved = resolve_url_value(url, &aliased_base);
        resolve_alias(&entry, &resolved)
    });

    let entry = Arc::clone(&ctx.override_entry);
    engine.register_fn("resolve_url", move |url: &str| -> String {
        resolve_alias(&entry, &resolve_url_value(url, ""))
    });

    engine.register_fn("get_pathname", |url: &str| -> String {
        match Url::parse(url.trim()) {
            Ok(u) => u.path().to_string(),
            Err(_) => String::new(),
        }
    });
}

// ------------------------------------------------------------------
// DOM（委托给 DomStore）
// ------------------------------------------------------------------

fn register_dom(engine: &mut Engine, ctx: &BridgeContext) {
    let dom = &ctx.dom;

    fn handles_to_array(handles: Vec<i64>) -> Array {
        handles.into_iter().map(Dynamic::from).collect()
    }

    fn opt_handle(handle: Option<i64>) -> i64 {
        handle.unwrap_or(NOT_FOUND)
    }

    fn opt_string(value: Option<String>) -> Dynamic {
        match value {
            Some(v) => Dynamic::from(v),
            None => Dynamic::UNIT,
        }
    }

    macro_rules! with_dom {
        ($name:literal, |$store:ident $(, $arg:ident : $ty:ty)*| $body:expr) => {{
            let dom = Arc::clone(dom);
            engine.register_fn($name, move |$($arg: $ty),*| {
                let mut $store = lock_or_inner(&dom);
                $body
            });
        }};
    }

    with_dom!("dom_load", |store, html: &str| store.load_document(html));
    with_dom!("dom_select", |store, h: i64, sel: &str| handles_to_array(
        store.select(h, sel)
    ));
    with_dom!("dom_parent", |store, h: i64| opt_handle(store.parent(h)));
    with_dom!("dom_children", |store, h: i64| handles_to_array(
        store.children(h, None)
    ));
    with_dom!("dom_children", |store, h: i64, sel: &str| handles_to_array(
        store.children(h, Some(sel))
    ));
    with_dom!("dom_next", |store, h: i64| opt_handle(store.next(h, None)));
    with_dom!("dom_next", |store, h: i64, sel: &str| opt_handle(
        store.next(h, Some(sel))
    ));
    with_dom!("dom_prev", |store, h: i64| opt_handle(store.prev(h, None)));
    with_dom!("dom_prev", |store, h: i64, sel: &str| opt_handle(
        store.prev(h, Some(sel))
    ));
    with_dom!("dom_next_all", |store, h: i64| handles_to_array(
        store.next_all(h, None)
    ));
    with_dom!("dom_next_all", |store, h: i64, sel: &str| handles_to_array(
        store.next_all(h, Some(sel))
    ));
    with_dom!("dom_prev_all", |store, h: i64| handles_to_array(
        store.prev_all(h, None)
    ));
    with_dom!("dom_prev_all", |store, h: i64, sel: &str| handles_to_array(
        store.prev_all(h, Some(sel))
    ));
    with_dom!("dom_siblings", |store, h: i64| handles_to_array(
        store.siblings(h, None)
    ));
    with_dom!("dom_siblings", |store, h: i64, sel: &str| handles_to_array(
        store.siblings(h, Some(sel))
    ));
    with_dom!("dom_closest", |store, h: i64, sel: &str| opt_handle(
        store.closest(h, sel)
    ));
    with_dom!("dom_contents", |store, h: i64| handles_to_array(
        store.contents(h)
    ));
    with_dom!("dom_is", |store, h: i64, sel: &str| store.matches(h, sel));
    with_dom!("dom_has", |store, h: i64, sel: &str| store.has(h, sel));
    with_dom!("dom_not", |store, h: i64, sel: &str| handles_to_array(
        store.not(h, sel)
    ));
    with_dom!("dom_html", |store, h: i64| store.html(h));
    with_dom!("dom_outer_html", |store, h: i64| store.outer_html(h));
    with_dom!("dom_text", |store, h: i64| store.text(h));
    with_dom!("dom_attr", |store, h: i64, name: &str| opt_string(
        store.attr(h, name)
    ));
    with_dom!("dom_attrs", |store, h: i64| {
        let mut map = Map::new();
        for (name, value) in store.all_attrs(h) {
            map.insert(name.into(), Dynamic::from(value));
        }
        map
    });
    with_dom!("dom_has_class", |store, h: i64, class: &str| store
        .has_class(h, class));
    with_dom!("dom_data", |store, h: i64, key: &str| opt_string(
        store.data(h, key)
    ));
    with_dom!("dom_val", |store, h: i64| opt_string(store.val(h)));
    with_dom!("dom_tag_name", |store, h: i64| store.tag_name(h));
    with_dom!("dom_is_text_node", |store, h: i64| store.is_text_node(h));
    with_dom!("dom_replace_with", |store, h: i64, html: &str| store
        .replace_with(h, html));
    with_dom!("dom_remove", |store, h: i64| store.remove(h));
    with_dom!("dom_add_class", |store, h: i64, class: &str| store
        .add_class(h, class));
    with_dom!("dom_remove_class", |store, h: i64, class: &str| store
        .remove_class(h, class));
    with_dom!("dom_release", |store, h: i64| store.release(h));
    with_dom!("dom_release_all", |store| store.release_all());
}
