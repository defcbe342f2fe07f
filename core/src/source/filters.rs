//! 过滤器映射：通用过滤器定义文档 <-> 类型化过滤器 <-> 脚本期望的取值文档。
//!
//! 定义文档形如 `{ key: {type, label, value?, options?} }`；
//! 取值文档形如 `{ key: {type, value} }`。选项顺序与选中状态全程保留。

use serde::{Deserialize, Serialize};

pub const FILTER_TYPE_TEXT: &str = "Text";
pub const FILTER_TYPE_SWITCH: &str = "Switch";
pub const FILTER_TYPE_PICKER: &str = "Picker";
pub const FILTER_TYPE_CHECKBOX: &str = "Checkbox";
pub const FILTER_TYPE_XCHECKBOX: &str = "XCheckbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    Ignore,
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOption {
    pub label: String,
    pub value: String,
}

/// UI 可展示的类型化过滤器。Checkbox/XCheckbox 的状态向量与 options 对齐。
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Text {
        key: String,
        label: String,
        value: String,
    },
    Switch {
        key: String,
        label: String,
        value: bool,
    },
    Picker {
        key: String,
        label: String,
        options: Vec<FilterOption>,
        selected: usize,
    },
    Checkbox {
        key: String,
        label: String,
        options: Vec<FilterOption>,
        checked: Vec<bool>,
    },
    XCheckbox {
        key: String,
        label: String,
        options: Vec<FilterOption>,
        states: Vec<TriState>,
    },
}

#[derive(Deserialize)]
struct FilterDefinition {
    #[serde(rename = "type")]
    kind: String,
    label: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    options: Option<Vec<FilterOption>>,
}

/// 解析过滤器定义文档；空白/"null"/解析失败都降级为空列表
pub fn to_filter_list(payload: Option<&str>) -> Vec<Filter> {
    let payload = match payload {
        Some(p) if !p.trim().is_empty() && p.trim() != "null" => p,
        _ => return Vec::new(),
    };
    let defs: std::collections::BTreeMap<String, FilterDefinition> =
        match serde_json::from_str(payload) {
            Ok(defs) => defs,
            Err(_) => return Vec::new(),
        };

    let mut filters = Vec::new();
    for (key, def) in defs {
        match def.kind.as_str() {
            FILTER_TYPE_TEXT => filters.push(Filter::Text {
                key,
                label: def.label,
                value: primitive_content(def.value.as_ref()).unwrap_or_default(),
            }),
            FILTER_TYPE_SWITCH => filters.push(Filter::Switch {
                key,
                label: def.label,
                value: primitive_bool(def.value.as_ref()),
            }),
            FILTER_TYPE_PICKER => {
                let options = def.options.unwrap_or_default();
                let default_value = primitive_content(def.value.as_ref());
                let selected = default_value
                    .as_deref()
                    .and_then(|v| options.iter().position(|o| o.value == v))
                    .unwrap_or(0);
                filters.push(Filter::Picker {
                    key,
                    label: def.label,
                    options,
                    selected,
                });
            }
            FILTER_TYPE_CHECKBOX => {
                let selected = string_values(def.value.as_ref());
                let options = def.options.unwrap_or_default();
                let checked = options
                    .iter()
                    .map(|o| selected.contains(&o.value))
                    .collect();
                filters.push(Filter::Checkbox {
                    key,
                    label: def.label,
                    options,
                    checked,
                });
            }
            FILTER_TYPE_XCHECKBOX => {
                let include = string_values(def.value.as_ref().and_then(|v| v.get("include")));
                let exclude = string_values(def.value.as_ref().and_then(|v| v.get("exclude")));
                let options = def.options.unwrap_or_default();
                let states = options
                    .iter()
                    .map(|o| {
                        if include.contains(&o.value) {
                            TriState::Include
                        } else if exclude.contains(&o.value) {
                            TriState::Exclude
                        } else {
                            TriState::Ignore
                        }
                    })
                    .collect();
                filters.push(Filter::XCheckbox {
                    key,
                    label: def.label,
                    options,
                    states,
                });
            }
            _ => {}
        }
    }
    filters
}

/// 转回脚本期望的取值文档：每个过滤器都贡献一个 `{type, value}` 条目
pub fn to_filter_values(filters: &[Filter]) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for filter in filters {
        let (key, kind, value) = match filter {
            Filter::Text { key, value, .. } => (
                key,
                FILTER_TYPE_TEXT,
                serde_json::Value::String(value.clone()),
            ),
            Filter::Switch { key, value, .. } => {
                (key, FILTER_TYPE_SWITCH, serde_json::Value::Bool(*value))
            }
            Filter::Picker {
                key,
                options,
                selected,
                ..
            } => {
                let value = options
                    .get(*selected)
                    .map(|o| o.value.clone())
                    .unwrap_or_default();
                (key, FILTER_TYPE_PICKER, serde_json::Value::String(value))
            }
            Filter::Checkbox {
                key,
                options,
                checked,
                ..
            } => {
                let values: Vec<serde_json::Value> = options
                    .iter()
                    .zip(checked.iter())
                    .filter(|(_, on)| **on)
                    .map(|(o, _)| serde_json::Value::String(o.value.clone()))
                    .collect();
                (key, FILTER_TYPE_CHECKBOX, serde_json::Value::Array(values))
            }
            Filter::XCheckbox {
                key,
                options,
                states,
                ..
            } => {
                let pick = |wanted: TriState| -> Vec<serde_json::Value> {
                    options
                        .iter()
                        .zip(states.iter())
                        .filter(|(_, s)| **s == wanted)
                        .map(|(o, _)| serde_json::Value::String(o.value.clone()))
                        .collect()
                };
                let value = serde_json::json!({
                    "include": pick(TriState::Include),
                    "exclude": pick(TriState::Exclude),
                });
                (key, FILTER_TYPE_XCHECKBOX, value)
            }
        };
        obj.insert(
            key.clone(),
            serde_json::json!({ "type": kind, "value": value }),
        );
    }
    serde_json::Value::Object(obj)
}

/// 显式过滤器与缓存默认值的合并：只要显式集合非空就完全忽略缓存，
/// 仅在显式集合为空时回落到缓存的定义文档。
pub fn to_filter_values_with_defaults(
    filters: &[Filter],
    cached_payload: Option<&str>,
) -> serde_json::Value {
    let explicit = to_filter_values(filters);
    if explicit
        .as_object()
        .map(|o| !o.is_empty())
        .unwrap_or(false)
    {
        return explicit;
    }

    let fallback = to_filter_list(cached_payload);
    if fallback.is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    to_filter_values(&fallback)
}

fn primitive_content(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn primitive_bool(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// 选中值集合：数组逐项取字符串；单个字符串按 `, ; |` 切分（遗留写法）
fn string_values(value: Option<&serde_json::Value>) -> std::collections::HashSet<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(serde_json::Value::String(s)) => delimited_values(s).into_iter().collect(),
        _ => Default::default(),
    }
}

fn delimited_values(value: &str) -> Vec<String> {
    let raw = value.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if !raw.contains([',', ';', '|']) {
        return vec![raw.to_string()];
    }
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFS: &str = r#"{
        "q": { "type": "Text", "label": "Query", "value": "init" },
        "adult": { "type": "Switch", "label": "Adult", "value": "true" },
        "sort": {
            "type": "Picker", "label": "Sort",
            "options": [
                { "label": "Newest", "value": "new" },
                { "label": "Popular", "value": "pop" }
            ],
            "value": "pop"
        },
        "tags": {
            "type": "Checkbox", "label": "Tags",
            "options": [
                { "label": "A", "value": "a" },
                { "label": "B", "value": "b" },
                { "label": "C", "value": "c" }
            ],
            "value": "a, c"
        },
        "genres": {
            "type": "XCheckbox", "label": "Genres",
            "options": [
                { "label": "One", "value": "1" },
                { "label": "Two", "value": "2" }
            ],
            "value": { "include": ["1"], "exclude": ["2"] }
        },
        "bogus": { "type": "Slider", "label": "ignored" }
    }"#;

    #[test]
    fn test_definition_document_to_typed_filters() {
        let filters = to_filter_list(Some(DEFS));
        // 未知类型被跳过
        assert_eq!(filters.len(), 5);

        let sort = filters
            .iter()
            .find_map(|f| match f {
                Filter::Picker {
                    options, selected, ..
                } => Some((options.clone(), *selected)),
                _ => None,
            })
            .unwrap();
        assert_eq!(sort.1, 1);
        assert_eq!(sort.0[0].label, "Newest");

        let tags = filters
            .iter()
            .find_map(|f| match f {
                Filter::Checkbox { checked, .. } => Some(checked.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(tags, vec![true, false, true]);

        let genres = filters
            .iter()
            .find_map(|f| match f {
                Filter::XCheckbox { states, .. } => Some(states.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(genres, vec![TriState::Include, TriState::Exclude]);
    }

    #[test]
    fn test_values_document_shape_preserved() {
        let filters = to_filter_list(Some(DEFS));
        let values = to_filter_values(&filters);

        assert_eq!(values["q"]["type"], "Text");
        assert_eq!(values["q"]["value"], "init");
        assert_eq!(values["adult"]["value"], true);
        assert_eq!(values["sort"]["value"], "pop");
        assert_eq!(values["tags"]["value"], serde_json::json!(["a", "c"]));
        assert_eq!(
            values["genres"]["value"],
            serde_json::json!({ "include": ["1"], "exclude": ["2"] })
        );
    }

    #[test]
    fn test_malformed_or_null_payload_degrades() {
        assert!(to_filter_list(None).is_empty());
        assert!(to_filter_list(Some("null")).is_empty());
        assert!(to_filter_list(Some("{broken")).is_empty());
    }

    #[test]
    fn test_cached_defaults_used_only_when_explicit_empty() {
        let cached = r#"{ "q": { "type": "Text", "label": "Q", "value": "cached" } }"#;

        // 显式为空：回落缓存
        let values = to_filter_values_with_defaults(&[], Some(cached));
        assert_eq!(values["q"]["value"], "cached");

        // 有任何显式过滤器：缓存被完全忽略
        let explicit = vec![Filter::Text {
            key: "other".to_string(),
            label: "O".to_string(),
            value: "x".to_string(),
        }];
        let values = to_filter_values_with_defaults(&explicit, Some(cached));
        assert!(values.get("q").is_none());
        assert_eq!(values["other"]["value"], "x");

        // 双空：空对象
        let values = to_filter_values_with_defaults(&[], None);
        assert_eq!(values, serde_json::json!({}));
    }
}
