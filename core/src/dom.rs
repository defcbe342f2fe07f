//! 句柄式 DOM 存储：为沙箱的文档查询桥提供后端。
//!
//! 每个解析出的文档节点分配一个稳定的整数句柄，脚本侧只操作句柄，
//! 全部树遍历留在原生侧完成。句柄按节点身份记忆化：同一节点再次被
//! 选中时返回同一句柄（脚本可以用句柄相等判断节点相等并做缓存）。
//!
//! 驻留句柄数量有上限，超出时按“最久未触碰”先淘汰（每次查找都会刷新
//! 热度）。淘汰只是内存上界，不影响正确性：被淘汰的句柄再次被查询时
//! 表现为“未找到”（空白结果），调用方必须容忍。
//!
//! 线程安全：实例**不是**线程安全的，每个插件运行时独占一个存储，
//! 调用发生在该插件的执行线程上（沙箱用 `Arc<Mutex<DomStore>>` 包装）。

use std::collections::HashMap;
use std::num::NonZeroUsize;

use ego_tree::{NodeId, Tree};
use html5ever::{local_name, namespace_url, ns, QualName};
use lru::LruCache;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

const MAX_HANDLES: usize = 50_000;

/// 节点身份：同一存储内允许多个文档驻留，身份 = (文档序号, 树内节点 id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
    doc: usize,
    node: NodeId,
}

pub struct DomStore {
    docs: Vec<Html>,
    next_handle: i64,
    /// 句柄 → 节点，按访问序维护淘汰顺序
    resident: LruCache<i64, NodeKey>,
    /// 节点 → 句柄（身份记忆化的 O(1) 反向索引）
    by_node: HashMap<NodeKey, i64>,
}

impl DomStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HANDLES)
    }

    pub fn with_capacity(max_handles: usize) -> Self {
        let cap = NonZeroUsize::new(max_handles.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            docs: Vec::new(),
            next_handle: 1,
            resident: LruCache::new(cap),
            by_node: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // 文档生命周期
    // ------------------------------------------------------------------

    /// 解析 HTML 并返回根句柄。
    ///
    /// 根句柄指向可见的内容根元素；解析器自带的不可见包装根永不暴露，
    /// 因此可见根的 `parent()` 报告“无父节点”。
    pub fn load_document(&mut self, html: &str) -> i64 {
        let doc = Html::parse_document(html);
        let root = doc.root_element().id();
        self.docs.push(doc);
        self.assign(NodeKey {
            doc: self.docs.len() - 1,
            node: root,
        })
    }

    // ------------------------------------------------------------------
    // CSS 选择
    // ------------------------------------------------------------------

    pub fn select(&mut self, handle: i64, selector: &str) -> Vec<i64> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        let Some(sel) = parse_selector(selector) else {
            return Vec::new();
        };
        let ids: Vec<NodeId> = {
            let Some(el) = self.element(key) else {
                return Vec::new();
            };
            el.select(&sel).map(|e| e.id()).collect()
        };
        self.assign_all(key.doc, ids)
    }

    // ------------------------------------------------------------------
    // 树遍历
    // ------------------------------------------------------------------

    pub fn parent(&mut self, handle: i64) -> Option<i64> {
        let key = self.lookup(handle)?;
        let parent_key = {
            let doc = self.docs.get(key.doc)?;
            let node = doc.tree.get(key.node)?;
            let p = node.parent()?;
            if p.value().is_document() || p.value().is_fragment() {
                return None;
            }
            NodeKey {
                doc: key.doc,
                node: p.id(),
            }
        };
        Some(self.assign(parent_key))
    }

    pub fn children(&mut self, handle: i64, selector: Option<&str>) -> Vec<i64> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        let sel = match compile_filter(selector) {
            Ok(sel) => sel,
            Err(()) => return Vec::new(),
        };
        let ids: Vec<NodeId> = {
            let Some(el) = self.element(key) else {
                return Vec::new();
            };
            el.children()
                .filter_map(ElementRef::wrap)
                .filter(|child| matches_filter(child, sel.as_ref()))
                .map(|child| child.id())
                .collect()
        };
        self.assign_all(key.doc, ids)
    }

    pub fn next(&mut self, handle: i64, selector: Option<&str>) -> Option<i64> {
        self.adjacent(handle, selector, Direction::Forward, true)
            .into_iter()
            .next()
    }

    pub fn prev(&mut self, handle: i64, selector: Option<&str>) -> Option<i64> {
        self.adjacent(handle, selector, Direction::Backward, true)
            .into_iter()
            .next()
    }

    pub fn next_all(&mut self, handle: i64, selector: Option<&str>) -> Vec<i64> {
        self.adjacent(handle, selector, Direction::Forward, false)
    }

    pub fn prev_all(&mut self, handle: i64, selector: Option<&str>) -> Vec<i64> {
        self.adjacent(handle, selector, Direction::Backward, false)
    }

    pub fn siblings(&mut self, handle: i64, selector: Option<&str>) -> Vec<i64> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        let sel = match compile_filter(selector) {
            Ok(sel) => sel,
            Err(()) => return Vec::new(),
        };
        let ids: Vec<NodeId> = {
            let Some(el) = self.element(key) else {
                return Vec::new();
            };
            let Some(parent) = el.parent().and_then(ElementRef::wrap) else {
                return Vec::new();
            };
            parent
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|sib| sib.id() != key.node && matches_filter(sib, sel.as_ref()))
                .map(|sib| sib.id())
                .collect()
        };
        self.assign_all(key.doc, ids)
    }

    pub fn closest(&mut self, handle: i64, selector: &str) -> Option<i64> {
        let key = self.lookup(handle)?;
        let sel = parse_selector(selector)?;
        let found = {
            let mut cur = self.element(key);
            let mut found = None;
            while let Some(el) = cur {
                if sel.matches(&el) {
                    found = Some(el.id());
                    break;
                }
                cur = el.parent().and_then(ElementRef::wrap);
            }
            found
        }?;
        Some(self.assign(NodeKey {
            doc: key.doc,
            node: found,
        }))
    }

    /// 所有子节点句柄，包含文本节点
    pub fn contents(&mut self, handle: i64) -> Vec<i64> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        let ids: Vec<NodeId> = {
            let Some(el) = self.element(key) else {
                return Vec::new();
            };
            el.children().map(|c| c.id()).collect()
        };
        self.assign_all(key.doc, ids)
    }

    // ------------------------------------------------------------------
    // 谓词
    // ------------------------------------------------------------------

    pub fn matches(&mut self, handle: i64, selector: &str) -> bool {
        let Some(key) = self.lookup(handle) else {
            return false;
        };
        let Some(sel) = parse_selector(selector) else {
            return false;
        };
        self.element(key).map(|el| sel.matches(&el)).unwrap_or(false)
    }

    pub fn has(&mut self, handle: i64, selector: &str) -> bool {
        let Some(key) = self.lookup(handle) else {
            return false;
        };
        let Some(sel) = parse_selector(selector) else {
            return false;
        };
        self.element(key)
            .map(|el| el.select(&sel).next().is_some())
            .unwrap_or(false)
    }

    /// 作用于单个元素：不匹配 selector 时返回其自身句柄
    pub fn not(&mut self, handle: i64, selector: &str) -> Vec<i64> {
        if self.lookup(handle).is_none() {
            return Vec::new();
        }
        if self.matches(handle, selector) {
            Vec::new()
        } else {
            vec![handle]
        }
    }

    // ------------------------------------------------------------------
    // 内容访问
    // ------------------------------------------------------------------

    pub fn html(&mut self, handle: i64) -> String {
        let Some(key) = self.lookup(handle) else {
            return String::new();
        };
        match self.element(key) {
            Some(el) => el.inner_html(),
            None => self.text_node_content(key).unwrap_or_default(),
        }
    }

    pub fn outer_html(&mut self, handle: i64) -> String {
        let Some(key) = self.lookup(handle) else {
            return String::new();
        };
        match self.element(key) {
            Some(el) => el.html(),
            None => self.text_node_content(key).unwrap_or_default(),
        }
    }

    pub fn text(&mut self, handle: i64) -> String {
        let Some(key) = self.lookup(handle) else {
            return String::new();
        };
        match self.element(key) {
            Some(el) => el.text().collect::<String>(),
            None => self.text_node_content(key).unwrap_or_default(),
        }
    }

    pub fn attr(&mut self, handle: i64, name: &str) -> Option<String> {
        let key = self.lookup(handle)?;
        self.element(key)?
            .value()
            .attr(name)
            .map(|v| v.to_string())
    }

    pub fn all_attrs(&mut self, handle: i64) -> Vec<(String, String)> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        match self.element(key) {
            Some(el) => el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_class(&mut self, handle: i64, class_name: &str) -> bool {
        self.attr(handle, "class")
            .map(|classes| classes.split_whitespace().any(|c| c == class_name))
            .unwrap_or(false)
    }

    pub fn data(&mut self, handle: i64, key: &str) -> Option<String> {
        self.attr(handle, &format!("data-{}", key))
    }

    /// 表单值：`<textarea>` 取文本，其余取 `value` 属性
    pub fn val(&mut self, handle: i64) -> Option<String> {
        let key = self.lookup(handle)?;
        let el = self.element(key)?;
        if el.value().name() == "textarea" {
            Some(el.text().collect::<String>())
        } else {
            el.value().attr("value").map(|v| v.to_string())
        }
    }

    pub fn tag_name(&mut self, handle: i64) -> String {
        let Some(key) = self.lookup(handle) else {
            return String::new();
        };
        self.element(key)
            .map(|el| el.value().name().to_string())
            .unwrap_or_default()
    }

    pub fn is_text_node(&mut self, handle: i64) -> bool {
        let Some(key) = self.lookup(handle) else {
            return false;
        };
        self.node_value(key)
            .map(|node| node.is_text())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // 变更
    // ------------------------------------------------------------------

    /// 用解析后的片段节点替换目标：先按原顺序插到目标之前，再删除目标。
    /// 空片段退化为纯删除。
    pub fn replace_with(&mut self, handle: i64, new_html: &str) {
        let Some(key) = self.lookup(handle) else {
            return;
        };
        let fragment = Html::parse_fragment(new_html);
        let frag_root = fragment.root_element().id();
        let top: Vec<NodeId> = fragment
            .tree
            .get(frag_root)
            .map(|n| n.children().map(|c| c.id()).collect())
            .unwrap_or_default();

        let Some(doc) = self.docs.get_mut(key.doc) else {
            return;
        };
        for src_id in top {
            let Some(value) = fragment.tree.get(src_id).map(|n| n.value().clone()) else {
                continue;
            };
            let new_id = match doc.tree.get_mut(key.node) {
                Some(mut target) => target.insert_before(value).id(),
                None => return,
            };
            copy_children(&mut doc.tree, new_id, &fragment.tree, src_id);
        }
        if let Some(mut target) = doc.tree.get_mut(key.node) {
            target.detach();
        }
    }

    pub fn remove(&mut self, handle: i64) {
        let Some(key) = self.lookup(handle) else {
            return;
        };
        if let Some(doc) = self.docs.get_mut(key.doc) {
            if let Some(mut node) = doc.tree.get_mut(key.node) {
                node.detach();
            }
        }
    }

    pub fn add_class(&mut self, handle: i64, class_name: &str) {
        self.update_classes(handle, |classes| {
            if !classes.iter().any(|c| c == class_name) {
                classes.push(class_name.to_string());
            }
        });
    }

    pub fn remove_class(&mut self, handle: i64, class_name: &str) {
        self.update_classes(handle, |classes| {
            classes.retain(|c| c != class_name);
        });
    }

    // ------------------------------------------------------------------
    // 句柄生命周期
    // ------------------------------------------------------------------

    pub fn release(&mut self, handle: i64) {
        if let Some(key) = self.resident.pop(&handle) {
            self.by_node.remove(&key);
        }
    }

    pub fn release_all(&mut self) {
        self.resident.clear();
        self.by_node.clear();
        self.docs.clear();
        self.next_handle = 1;
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    // ------------------------------------------------------------------
    // 内部
    // ------------------------------------------------------------------

    /// 句柄 → 节点；命中会刷新淘汰热度
    fn lookup(&mut self, handle: i64) -> Option<NodeKey> {
        self.resident.get(&handle).copied()
    }

    /// 身份记忆化分配：同一节点返回既有句柄，否则发放新句柄并登记。
    /// 超过驻留上限时 LRU 端被淘汰，反向索引同步清理。
    fn assign(&mut self, key: NodeKey) -> i64 {
        if let Some(&h) = self.by_node.get(&key) {
            self.resident.get(&h);
            return h;
        }
        let h = self.next_handle;
        self.next_handle += 1;
        if let Some((evicted_handle, evicted_key)) = self.resident.push(h, key) {
            if evicted_handle != h {
                self.by_node.remove(&evicted_key);
            }
        }
        self.by_node.insert(key, h);
        h
    }

    fn assign_all(&mut self, doc: usize, ids: Vec<NodeId>) -> Vec<i64> {
        ids.into_iter()
            .map(|node| self.assign(NodeKey { doc, node }))
            .collect()
    }

    fn element(&self, key: NodeKey) -> Option<ElementRef<'_>> {
        let doc = self.docs.get(key.doc)?;
        ElementRef::wrap(doc.tree.get(key.node)?)
    }

    fn node_value(&self, key: NodeKey) -> Option<&Node> {
        Some(self.docs.get(key.doc)?.tree.get(key.node)?.value())
    }

    fn text_node_content(&self, key: NodeKey) -> Option<String> {
        match self.node_value(key)? {
            Node::Text(t) => Some(t.to_string()),
            _ => None,
        }
    }

    fn adjacent(
        &mut self,
        handle: i64,
        selector: Option<&str>,
        direction: Direction,
        first_only: bool,
    ) -> Vec<i64> {
        let Some(key) = self.lookup(handle) else {
            return Vec::new();
        };
        let sel = match compile_filter(selector) {
            Ok(sel) => sel,
            Err(()) => return Vec::new(),
        };
        let ids: Vec<NodeId> = {
            let Some(doc) = self.docs.get(key.doc) else {
                return Vec::new();
            };
            let Some(start) = doc.tree.get(key.node) else {
                return Vec::new();
            };
            let mut out = Vec::new();
            let mut cur = match direction {
                Direction::Forward => start.next_sibling(),
                Direction::Backward => start.prev_sibling(),
            };
            while let Some(node) = cur {
                if let Some(el) = ElementRef::wrap(node) {
                    if matches_filter(&el, sel.as_ref()) {
                        out.push(el.id());
                        if first_only {
                            break;
                        }
                    }
                }
                cur = match direction {
                    Direction::Forward => node.next_sibling(),
                    Direction::Backward => node.prev_sibling(),
                };
            }
            out
        };
        self.assign_all(key.doc, ids)
    }

    fn update_classes(&mut self, handle: i64, f: impl FnOnce(&mut Vec<String>)) {
        let Some(key) = self.lookup(handle) else {
            return;
        };
        let Some(doc) = self.docs.get_mut(key.doc) else {
            return;
        };
        let Some(mut node) = doc.tree.get_mut(key.node) else {
            return;
        };
        if let Node::Element(el) = node.value() {
            let mut classes: Vec<String> = el
                .attr("class")
                .unwrap_or("")
                .split_whitespace()
                .map(|c| c.to_string())
                .collect();
            f(&mut classes);
            let name = QualName::new(None, ns!(), local_name!("class"));
            el.attrs.insert(name, classes.join(" ").as_str().into());
        }
    }
}

impl Default for DomStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

fn parse_selector(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

/// 可选过滤器：空白视为不过滤；给了但解析失败 → Err（结果为空）
fn compile_filter(selector: Option<&str>) -> Result<Option<Selector>, ()> {
    match selector {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_selector(s).map(Some).ok_or(()),
    }
}

fn matches_filter(el: &ElementRef<'_>, sel: Option<&Selector>) -> bool {
    sel.map(|s| s.matches(el)).unwrap_or(true)
}

fn copy_children(
    dst: &mut Tree<Node>,
    dst_parent: NodeId,
    src: &Tree<Node>,
    src_parent: NodeId,
) {
    let child_ids: Vec<NodeId> = match src.get(src_parent) {
        Some(n) => n.children().map(|c| c.id()).collect(),
        None => return,
    };
    for cid in child_ids {
        let Some(value) = src.get(cid).map(|n| n.value().clone()) else {
            continue;
        };
        let new_id = match dst.get_mut(dst_parent) {
            Some(mut parent) => parent.append(value).id(),
            None => return,
        };
        copy_children(dst, new_id, src, cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(html: &str) -> (DomStore, i64) {
        let mut store = DomStore::new();
        let root = store.load_document(html);
        (store, root)
    }

    #[test]
    fn test_handle_identity_memoized() {
        let (mut store, root) = store_with("<div><p id='a'>A</p></div>");
        let first = store.select(root, "#a");
        let second = store.select(root, "p");
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parent_of_root_is_not_found() {
        let (mut store, root) = store_with("<div><p id='a'>A</p></div>");
        assert_eq!(store.parent(root), None);

        let p = store.select(root, "#a")[0];
        let div = store.parent(p).expect("p has parent");
        assert_eq!(store.tag_name(div), "div");
    }

    #[test]
    fn test_next_prev_between_siblings() {
        let (mut store, root) = store_with("<div><p id='a'>A</p><p id='b'>B</p></div>");
        let a = store.select(root, "#a")[0];
        let b = store.select(root, "#b")[0];

        assert_eq!(store.next(a, None), Some(b));
        assert_eq!(store.prev(a, None), None);
        assert_eq!(store.prev(b, None), Some(a));
        assert_eq!(store.next(b, None), None);
    }

    #[test]
    fn test_traversal_with_selector_filters() {
        let (mut store, root) =
            store_with("<ul><li class='x'>1</li><li>2</li><li class='x'>3</li></ul>");
        let ul = store.select(root, "ul")[0];
        assert_eq!(store.children(ul, None).len(), 3);
        assert_eq!(store.children(ul, Some(".x")).len(), 2);

        let first = store.select(root, "li")[0];
        assert_eq!(store.next_all(first, None).len(), 2);
        assert_eq!(store.next_all(first, Some(".x")).len(), 1);
        assert_eq!(store.siblings(first, None).len(), 2);

        let third = store.select(root, "li.x")[1];
        assert_eq!(store.prev_all(third, None).len(), 2);
        assert_eq!(store.closest(third, "ul"), Some(ul));
        assert_eq!(store.closest(third, "table"), None);
    }

    #[test]
    fn test_contents_includes_text_nodes() {
        let (mut store, root) = store_with("<p>A<span>B</span>C</p>");
        let p = store.select(root, "p")[0];
        let contents = store.contents(p);
        assert_eq!(contents.len(), 3);
        assert!(store.is_text_node(contents[0]));
        assert!(!store.is_text_node(contents[1]));
        assert_eq!(store.text(contents[0]), "A");
        assert_eq!(store.text(contents[2]), "C");
    }

    #[test]
    fn test_accessors() {
        let (mut store, root) = store_with(
            "<div class='a b' data-key='v'><input value='iv'><textarea>tv</textarea></div>",
        );
        let div = store.select(root, "div")[0];
        assert!(store.has_class(div, "a"));
        assert!(!store.has_class(div, "c"));
        assert_eq!(store.data(div, "key").as_deref(), Some("v"));
        assert_eq!(store.attr(div, "missing"), None);
        assert!(store
            .all_attrs(div)
            .iter()
            .any(|(k, v)| k == "data-key" && v == "v"));

        let input = store.select(root, "input")[0];
        assert_eq!(store.val(input).as_deref(), Some("iv"));
        let textarea = store.select(root, "textarea")[0];
        assert_eq!(store.val(textarea).as_deref(), Some("tv"));

        assert!(store.matches(div, "div.a"));
        assert!(store.has(div, "input"));
        assert_eq!(store.not(div, "div"), Vec::<i64>::new());
        assert_eq!(store.not(div, "span"), vec![div]);
    }

    #[test]
    fn test_replace_with_preserves_sibling_order() {
        let (mut store, root) = store_with("<div><p id='a'>A</p><p id='b'>B</p></div>");
        let a = store.select(root, "#a")[0];
        store.replace_with(a, "<h1>X</h1><h2>Y</h2>");

        let div = store.select(root, "div")[0];
        let kids = store.children(div, None);
        let tags: Vec<String> = kids.iter().map(|&h| store.tag_name(h)).collect();
        assert_eq!(tags, vec!["h1", "h2", "p"]);
    }

    #[test]
    fn test_replace_with_empty_fragment_degrades_to_removal() {
        let (mut store, root) = store_with("<div><p id='a'>A</p><p id='b'>B</p></div>");
        let a = store.select(root, "#a")[0];
        store.replace_with(a, "");
        let div = store.select(root, "div")[0];
        assert_eq!(store.children(div, None).len(), 1);
    }

    #[test]
    fn test_class_mutations() {
        let (mut store, root) = store_with("<p class='one'>A</p>");
        let p = store.select(root, "p")[0];
        store.add_class(p, "two");
        assert!(store.has_class(p, "one"));
        assert!(store.has_class(p, "two"));
        store.add_class(p, "two");
        store.remove_class(p, "one");
        assert!(!store.has_class(p, "one"));
        assert_eq!(store.attr(p, "class").as_deref(), Some("two"));
    }

    #[test]
    fn test_remove_detaches_node() {
        let (mut store, root) = store_with("<div><p>A</p><p>B</p></div>");
        let first = store.select(root, "p")[0];
        store.remove(first);
        let div = store.select(root, "div")[0];
        assert_eq!(store.children(div, None).len(), 1);
    }

    #[test]
    fn test_eviction_is_lru_and_tolerated() {
        let mut store = DomStore::with_capacity(2);
        let root = store.load_document("<div><p id='a'>A</p><p id='b'>B</p></div>");
        let a = store.select(root, "#a")[0];
        store.text(a);

        // select 先触碰 root，再分配 #b：此刻最久未触碰的是 a，被淘汰
        let b = store.select(root, "#b")[0];
        assert_eq!(store.resident_count(), 2);

        // 被淘汰的句柄表现为“未找到”：空白结果而不是错误
        assert_eq!(store.tag_name(a), "");
        assert_eq!(store.text(a), "");
        assert_eq!(store.select(a, "p"), Vec::<i64>::new());
        assert_eq!(store.tag_name(b), "p");

        // 重新选中被淘汰的节点会得到新句柄（驻留期内才保证句柄稳定）
        let a2 = store.select(root, "#a")[0];
        assert_ne!(a2, a);
    }

    #[test]
    fn test_release_all_resets() {
        let (mut store, root) = store_with("<p>A</p>");
        assert!(store.resident_count() > 0);
        store.release(root);
        store.release_all();
        assert_eq!(store.resident_count(), 0);
        assert_eq!(store.select(root, "p"), Vec::<i64>::new());
    }
}
