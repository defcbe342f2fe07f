//! Source 能力面：外部协作方（浏览/阅读界面）消费插件的唯一入口。
//!
//! 工厂从存储取出已校验的脚本，套上覆写补丁与模块外壳，绑定到全新的
//! 沙箱与 DOM 存储；所有操作同步执行（内部可能阻塞在网络 I/O 上），
//! 方法取 `&mut self`，同一源实例的调用由类型系统强制串行。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::plugin::kv::PluginKeyValueStore;
use crate::plugin::overrides::{apply_patches, ChapterFallbackPolicy, RuntimeOverrides};
use crate::plugin::storage::PluginStorage;
use crate::runtime::EventEmitter;
use crate::sandbox::{dynamic_to_json, json_to_dynamic, PluginRuntime, SandboxConfig};

pub mod filters;
pub mod normalizer;

use filters::Filter;

/// 列表项（搜索/热门结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NovelItem {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub cover: Option<String>,
}

/// 书目详情 + 章节列表
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Novel {
    pub name: String,
    pub path: String,
    pub cover: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub status: Option<String>,
    pub genres: Vec<String>,
    pub chapters: Vec<ParsedPluginChapter>,
}

/// 所有插件章节输出最终被强制成的归一形状
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPluginChapter {
    pub name: Option<String>,
    pub path: Option<String>,
    pub chapter_number: Option<f64>,
}

impl ParsedPluginChapter {
    /// 字段名宽容：`name`/`title`、`path`/`url`、`chapterNumber`/`number`
    pub fn from_value(value: &serde_json::Value) -> Self {
        let get_str = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| value.get(*k))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let number = ["chapterNumber", "number"]
            .iter()
            .find_map(|k| value.get(*k))
            .and_then(|v| v.as_f64());
        Self {
            name: get_str(&["name", "title"]),
            path: get_str(&["path", "url"]),
            chapter_number: number,
        }
    }
}

/// 一个可调用的插件源：搜索/浏览/解析操作由沙箱内的脚本函数实现
pub struct NovelSource {
    plugin_id: String,
    runtime: PluginRuntime,
    policy: ChapterFallbackPolicy,
}

impl std::fmt::Debug for NovelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NovelSource")
            .field("plugin_id", &self.plugin_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl NovelSource {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// 热门列表；脚本未实现 `popular_novels` 时返回空列表
    pub fn popular(&mut self, page: i64) -> Result<Vec<NovelItem>, PluginError> {
        if !self.runtime.has_function("popular_novels") {
            return Ok(Vec::new());
        }
        let out = self.runtime.call("popular_novels", (page,))?;
        Ok(parse_novel_items(&dynamic_to_json(&out)))
    }

    /// 搜索；`filters` 转成脚本期望的取值文档一并传入
    pub fn search(
        &mut self,
        query: &str,
        filter_list: &[Filter],
        page: i64,
    ) -> Result<Vec<NovelItem>, PluginError> {
        self.search_with_values(query, filters::to_filter_values(filter_list), page)
    }

    /// 搜索（带缓存默认过滤器回落）：显式集合非空时缓存被完全忽略
    pub fn search_with_cached_defaults(
        &mut self,
        query: &str,
        filter_list: &[Filter],
        cached_filters: Option<&str>,
        page: i64,
    ) -> Result<Vec<NovelItem>, PluginError> {
        let values = filters::to_filter_values_with_defaults(filter_list, cached_filters);
        self.search_with_values(query, values, page)
    }

    fn search_with_values(
        &mut self,
        query: &str,
        values: serde_json::Value,
        page: i64,
    ) -> Result<Vec<NovelItem>, PluginError> {
        if !self.runtime.has_function("search_novels") {
            return Ok(Vec::new());
        }
        let out = self.runtime.call(
            "search_novels",
            (query.to_string(), page, json_to_dynamic(&values)),
        )?;
        Ok(parse_novel_items(&dynamic_to_json(&out)))
    }

    /// 脚本声明的过滤器定义（可选）
    pub fn filter_list(&mut self) -> Result<Vec<Filter>, PluginError> {
        if !self.runtime.has_function("filters") {
            return Ok(Vec::new());
        }
        let out = self.runtime.call("filters", ())?;
        let payload = serde_json::to_string(&dynamic_to_json(&out))
            .map_err(|e| PluginError::Script(format!("filters serialization failed: {}", e)))?;
        Ok(filters::to_filter_list(Some(&payload)))
    }

    /// 书目详情；`parse_novel` 是必需入口
    pub fn parse_novel(&mut self, path: &str) -> Result<Novel, PluginError> {
        let out = self.runtime.call("parse_novel", (path.to_string(),))?;
        let value = dynamic_to_json(&out);

        let get_str = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| value.get(*k))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let chapters = value
            .get("chapters")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(ParsedPluginChapter::from_value)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Novel {
            name: get_str(&["name", "title"]).unwrap_or_default(),
            path: get_str(&["path", "url"]).unwrap_or_else(|| path.to_string()),
            cover: get_str(&["cover"]),
            summary: get_str(&["summary"]),
            author: get_str(&["author"]),
            status: get_str(&["status"]),
            genres: value
                .get("genres")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            chapters: normalizer::normalize_chapters(&self.plugin_id, chapters, &self.policy),
        })
    }

    /// 章节列表；脚本未实现专用入口时回落到 `parse_novel` 的章节
    pub fn parse_chapter_list(
        &mut self,
        path: &str,
    ) -> Result<Vec<ParsedPluginChapter>, PluginError> {
        if !self.runtime.has_function("parse_chapter_list") {
            return Ok(self.parse_novel(path)?.chapters);
        }
        let out = self.runtime.call("parse_chapter_list", (path.to_string(),))?;
        let chapters = dynamic_to_json(&out)
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(ParsedPluginChapter::from_value)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(normalizer::normalize_chapters(
            &self.plugin_id,
            chapters,
            &self.policy,
        ))
    }

    /// 章节正文
    pub fn parse_chapter_text(&mut self, path: &str) -> Result<String, PluginError> {
        let out = self.runtime.call("parse_chapter_text", (path.to_string(),))?;
        Ok(out.into_string().unwrap_or_default())
    }
}

fn parse_novel_items(value: &serde_json::Value) -> Vec<NovelItem> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let path = item
                .get("path")
                .or_else(|| item.get("url"))
                .and_then(|v| v.as_str())?
                .to_string();
            let name = item
                .get("name")
                .or_else(|| item.get("title"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let cover = item
                .get("cover")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(NovelItem { name, path, cover })
        })
        .collect()
}

/// 把“已安装包 + 覆写 + 沙箱”装配成可调用的源
pub struct SourceFactory {
    storage: Arc<dyn PluginStorage>,
    overrides: Arc<RuntimeOverrides>,
    kv: Arc<PluginKeyValueStore>,
    emitter: Arc<dyn EventEmitter>,
    http_timeout: Duration,
}

impl SourceFactory {
    pub fn new(
        storage: Arc<dyn PluginStorage>,
        overrides: Arc<RuntimeOverrides>,
        kv: Arc<PluginKeyValueStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            storage,
            overrides,
            kv,
            emitter,
            http_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// 每次调用绑定全新的沙箱与 DOM 存储（源之间零共享）
    pub fn create(&self, plugin_id: &str) -> Result<NovelSource, PluginError> {
        let pkg = self
            .storage
            .get(plugin_id)?
            .ok_or_else(|| PluginError::ScriptNotFound(plugin_id.to_string()))?;

        let script_text = String::from_utf8_lossy(&pkg.script).into_owned();
        let override_entry = self.overrides.for_plugin(plugin_id);
        let patched = apply_patches(&override_entry, &script_text);
        let policy = override_entry.chapter_fallback_policy.clone();

        let runtime = PluginRuntime::new(SandboxConfig {
            plugin_id: plugin_id.to_string(),
            script: patched,
            site: pkg.entry.site.clone(),
            override_entry,
            kv: Arc::clone(&self.kv),
            emitter: Arc::clone(&self.emitter),
            extra_modules: Vec::new(),
            http_timeout: self.http_timeout,
        })?;

        Ok(NovelSource {
            plugin_id: plugin_id.to_string(),
            runtime,
            policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::overrides::{RuntimeOverride, ScriptPatch};
    use crate::plugin::repo::RepoEntry;
    use crate::plugin::storage::{InMemoryPluginStorage, PluginPackage};
    use crate::runtime::NoopEmitter;

    const DEMO_SCRIPT: &str = r#"
fn popular_novels(page) {
    let html = "<div class='novel'><a href='/n/1'>Alpha</a></div>"
        + "<div class='novel'><a href='/n/2'>Beta</a></div>";
    let d = dom_load(html);
    let items = [];
    for h in dom_select(d, "div.novel a") {
        items.push(#{ name: dom_text(h), path: dom_attr(h, "href") });
    }
    items
}

fn search_novels(query, page, filters) {
    let path = "/search/" + query + "/" + page;
    let mut_name = query;
    if "sort" in filters {
        mut_name = mut_name + ":" + filters.sort.value;
    }
    [#{ name: mut_name, path: path }]
}

fn parse_novel(path) {
    #{
        name: "Alpha",
        path: path,
        summary: "about",
        status: status::ONGOING,
        genres: ["fantasy", "action"],
        chapters: [
            #{ title: "", url: "/n/1/c1" },
            #{ url: "/n/1/c1" },
            #{ name: "Second", path: "/n/1/c2" }
        ]
    }
}

fn parse_chapter_text(path) {
    "<p>content of " + path + "</p>"
}
"#;

    fn demo_entry(id: &str) -> RepoEntry {
        RepoEntry {
            id: id.to_string(),
            name: "Demo".to_string(),
            site: "https://demo.example".to_string(),
            lang: "en".to_string(),
            version: 1,
            url: "https://demo.example/demo.rhai".to_string(),
            icon_url: None,
            custom_js_url: None,
            custom_css_url: None,
            has_settings: false,
            sha256: String::new(),
        }
    }

    fn factory_with_script(
        id: &str,
        script: &str,
        overrides: RuntimeOverrides,
    ) -> (tempfile::TempDir, SourceFactory) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(InMemoryPluginStorage::new());
        storage
            .save(&PluginPackage {
                entry: demo_entry(id),
                script: script.as_bytes().to_vec(),
                custom_js: None,
                custom_css: None,
            })
            .unwrap();
        let factory = SourceFactory::new(
            storage,
            Arc::new(overrides),
            Arc::new(PluginKeyValueStore::new(dir.path())),
            Arc::new(NoopEmitter),
        );
        (dir, factory)
    }

    #[test]
    fn test_source_popular_via_dom_bridge() {
        let (_dir, factory) =
            factory_with_script("demo", DEMO_SCRIPT, RuntimeOverrides::default());
        let mut source = factory.create("demo").unwrap();
        let items = source.popular(1).unwrap();
        assert_eq!(
            items,
            vec![
                NovelItem {
                    name: "Alpha".to_string(),
                    path: "/n/1".to_string(),
                    cover: None
                },
                NovelItem {
                    name: "Beta".to_string(),
                    path: "/n/2".to_string(),
                    cover: None
                },
            ]
        );
    }

    #[test]
    fn test_source_search_receives_filter_values() {
        let (_dir, factory) =
            factory_with_script("demo", DEMO_SCRIPT, RuntimeOverrides::default());
        let mut source = factory.create("demo").unwrap();

        let filter_list = vec![Filter::Picker {
            key: "sort".to_string(),
            label: "Sort".to_string(),
            options: vec![filters::FilterOption {
                label: "Popular".to_string(),
                value: "pop".to_string(),
            }],
            selected: 0,
        }];
        let items = source.search("tea", &filter_list, 2).unwrap();
        assert_eq!(items[0].name, "tea:pop");
        assert_eq!(items[0].path, "/search/tea/2");
    }

    #[test]
    fn test_source_parse_novel_normalizes_chapters() {
        let (_dir, factory) =
            factory_with_script("demo", DEMO_SCRIPT, RuntimeOverrides::default());
        let mut source = factory.create("demo").unwrap();
        let novel = source.parse_novel("/n/1").unwrap();

        assert_eq!(novel.name, "Alpha");
        assert_eq!(novel.status.as_deref(), Some("Ongoing"));
        assert_eq!(novel.genres, vec!["fantasy", "action"]);
        // 去重 + 缺名兜底
        assert_eq!(novel.chapters.len(), 2);
        assert_eq!(novel.chapters[0].name.as_deref(), Some("Chapter 1"));
        assert_eq!(novel.chapters[0].path.as_deref(), Some("/n/1/c1"));
        assert_eq!(novel.chapters[1].name.as_deref(), Some("Second"));
    }

    #[test]
    fn test_chapter_list_falls_back_to_parse_novel() {
        let (_dir, factory) =
            factory_with_script("demo", DEMO_SCRIPT, RuntimeOverrides::default());
        let mut source = factory.create("demo").unwrap();
        let chapters = source.parse_chapter_list("/n/1").unwrap();
        assert_eq!(chapters.len(), 2);

        let text = source.parse_chapter_text("/n/1/c1").unwrap();
        assert_eq!(text, "<p>content of /n/1/c1</p>");
    }

    #[test]
    fn test_missing_plugin_is_script_not_found() {
        let (_dir, factory) =
            factory_with_script("demo", DEMO_SCRIPT, RuntimeOverrides::default());
        let err = factory.create("nope").unwrap_err();
        assert!(matches!(err, PluginError::ScriptNotFound(_)));
    }

    #[test]
    fn test_factory_applies_script_patches_before_load() {
        // 脚本里漂移的选择器用覆写补丁修正，插件无需重新发布
        let script = r#"
fn popular_novels(page) {
    let d = dom_load("<div class='new-list'><a href='/n/1'>Alpha</a></div>");
    let items = [];
    for h in dom_select(d, "div.old-list a") {
        items.push(#{ name: dom_text(h), path: dom_attr(h, "href") });
    }
    items
}
"#;
        let overrides = RuntimeOverrides {
            entries: vec![RuntimeOverride {
                script_patches: vec![ScriptPatch {
                    pattern: "div.old-list".to_string(),
                    replacement: "div.new-list".to_string(),
                    regex: false,
                    ignore_case: false,
                }],
                ..RuntimeOverride::empty("demo")
            }],
        };
        let (_dir, factory) = factory_with_script("demo", script, overrides);
        let mut source = factory.create("demo").unwrap();
        let items = source.popular(1).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Alpha");
    }
}
