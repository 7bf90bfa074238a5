//! DOM snapshots and the selector map built from them.
//!
//! A snapshot is captured in the page as a nested JSON tree, flattened here
//! into an arena ([`DomTree`]) where every node knows its parent by id and the
//! chain of iframes enclosing it. The [`SelectorMap`] indexes the interactive
//! nodes in traversal order; an index is only meaningful for the snapshot it
//! was built from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::types::{PageState, clip};

/// JavaScript evaluated in the top-level page to produce the snapshot.
/// READ-ONLY: nothing in the page is modified.
///
/// The script:
///   1. Skips script, style, noscript, svg, template and head subtrees.
///   2. Walks the element tree (max depth 60) recording tag, a fixed set of
///      attributes, direct text and visibility.
///   3. Descends into iframe documents through `contentDocument`. Frames the
///      browser refuses to expose are emitted without children and marked
///      with an `inaccessible` attribute.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','TEMPLATE','HEAD','LINK','META']);
  const KEEP = ['id','type','name','role','href','placeholder','aria-label','title','value',
                'tabindex','onclick','contenteditable','disabled','src'];

  function isVisible(el, win) {
    const s = win.getComputedStyle(el);
    if (s.display === 'none' || s.visibility === 'hidden') return false;
    const r = el.getBoundingClientRect();
    return r.width > 0 || r.height > 0;
  }

  function walk(el, win, depth) {
    const node = { tag: el.tagName.toLowerCase(), attrs: {}, text: '', visible: true, children: [] };
    for (const name of KEEP) {
      const v = el.getAttribute(name);
      if (v !== null) node.attrs[name] = v.slice(0, 200);
    }
    if (typeof el.onclick === 'function' && !('onclick' in node.attrs)) node.attrs.onclick = '';
    try { node.visible = isVisible(el, win); } catch (e) {}
    let text = '';
    for (const c of el.childNodes) { if (c.nodeType === 3) text += c.textContent; }
    node.text = text.replace(/\s+/g, ' ').trim().slice(0, 100);
    if (depth > 60) return node;

    if (node.tag === 'iframe' || node.tag === 'frame') {
      let doc = null;
      try { doc = el.contentDocument; } catch (e) {}
      if (doc && doc.documentElement) {
        node.children.push(walk(doc.documentElement, doc.defaultView || win, depth + 1));
      } else {
        node.attrs.inaccessible = '';
      }
      return node;
    }
    for (const child of el.children) {
      if (SKIP.has(child.tagName.toUpperCase())) continue;
      node.children.push(walk(child, win, depth + 1));
    }
    return node;
  }

  return JSON.stringify({
    url: window.location.href,
    title: document.title,
    root: walk(document.documentElement, window, 0),
  });
})()
"#;

pub fn snapshot_script() -> &'static str {
    SNAPSHOT_JS
}

/// Tags that are always indexed.
const INTERACTIVE_TAGS: &[&str] = &[
    "a", "button", "input", "select", "textarea", "option", "summary", "details",
];

/// ARIA roles that make any element interactive.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "checkbox",
    "radio",
    "textbox",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "tab",
    "switch",
    "searchbox",
    "treeitem",
    "gridcell",
];

/// Attributes shown to the model next to the tag.
const LABEL_ATTRIBUTES: &[&str] = &["type", "name", "placeholder", "aria-label", "role", "value"];

pub type NodeId = usize;

/// Node shape produced by the snapshot script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
    #[serde(default)]
    pub children: Vec<RawNode>,
}

fn visible_by_default() -> bool {
    true
}

impl RawNode {
    pub fn element(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn child(mut self, child: RawNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
    pub visible: bool,
    /// Non-owning back-reference; the tree owns every node.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Enclosing iframe nodes, outermost first.
    pub iframe_path: Vec<NodeId>,
}

impl ElementNode {
    pub fn is_frame(&self) -> bool {
        self.tag == "iframe" || self.tag == "frame"
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// How an enclosing frame is found inside its parent document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSelector {
    /// The frame element's `id` attribute
    Id(String),
    /// Structural CSS path of the frame element within its parent document
    Path(String),
}

impl fmt::Display for FrameSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSelector::Id(id) => write!(f, "iframe[id={id:?}]"),
            FrameSelector::Path(path) => f.write_str(path),
        }
    }
}

/// Frame-scoped address of an element: each frame in `frames` is entered in
/// order, then `selector` is matched inside the innermost document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementLocator {
    #[serde(default)]
    pub frames: Vec<FrameSelector>,
    pub selector: String,
}

impl ElementLocator {
    pub fn top_level(selector: impl Into<String>) -> Self {
        Self {
            frames: Vec::new(),
            selector: selector.into(),
        }
    }

    pub fn is_framed(&self) -> bool {
        !self.frames.is_empty()
    }
}

impl fmt::Display for ElementLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            write!(f, "{frame} >>> ")?;
        }
        f.write_str(&self.selector)
    }
}

/// Arena holding every node of one snapshot. Ids follow pre-order traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomTree {
    nodes: Vec<ElementNode>,
}

impl DomTree {
    pub fn from_raw(root: RawNode) -> Self {
        let mut tree = Self::default();
        tree.insert(root, None);
        tree
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let root: RawNode = serde_json::from_str(json)?;
        Ok(Self::from_raw(root))
    }

    fn insert(&mut self, raw: RawNode, parent: Option<NodeId>) -> NodeId {
        let iframe_path = match parent {
            Some(p) => {
                let parent_node = &self.nodes[p];
                let mut path = parent_node.iframe_path.clone();
                if parent_node.is_frame() {
                    path.push(p);
                }
                path
            }
            None => Vec::new(),
        };

        let id = self.nodes.len();
        self.nodes.push(ElementNode {
            tag: raw.tag.to_ascii_lowercase(),
            attributes: raw.attrs,
            text: raw.text,
            visible: raw.visible,
            parent,
            children: Vec::new(),
            iframe_path,
        });

        for child in raw.children {
            let child_id = self.insert(child, Some(id));
            self.nodes[id].children.push(child_id);
        }
        id
    }

    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() { None } else { Some(0) }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ElementNode> {
        self.nodes.get(id)
    }

    pub fn is_interactive(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        if !node.visible {
            return false;
        }
        if node.tag == "input"
            && node
                .attr("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("hidden"))
        {
            return false;
        }
        if INTERACTIVE_TAGS.contains(&node.tag.as_str()) {
            return true;
        }
        if let Some(role) = node.attr("role") {
            if INTERACTIVE_ROLES.contains(&role.to_ascii_lowercase().as_str()) {
                return true;
            }
        }
        if node.attr("onclick").is_some() {
            return true;
        }
        if node
            .attr("contenteditable")
            .is_some_and(|v| !v.eq_ignore_ascii_case("false"))
        {
            return true;
        }
        node.attr("tabindex")
            .and_then(|v| v.trim().parse::<i32>().ok())
            .is_some_and(|t| t >= 0)
    }

    /// Structural CSS path of `id` inside the document that contains it,
    /// e.g. `html > body > div:nth-of-type(2) > button`.
    pub fn css_path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let node = &self.nodes[current];
            match node.parent {
                Some(parent) if !self.nodes[parent].is_frame() => {
                    let same_tag: Vec<NodeId> = self.nodes[parent]
                        .children
                        .iter()
                        .copied()
                        .filter(|&c| self.nodes[c].tag == node.tag)
                        .collect();
                    if same_tag.len() > 1 {
                        let position = same_tag.iter().position(|&c| c == current).unwrap_or(0) + 1;
                        segments.push(format!("{}:nth-of-type({position})", node.tag));
                    } else {
                        segments.push(node.tag.clone());
                    }
                    current = parent;
                }
                _ => {
                    segments.push(node.tag.clone());
                    break;
                }
            }
        }
        segments.reverse();
        segments.join(" > ")
    }

    fn frame_selector(&self, frame: NodeId) -> FrameSelector {
        match self.nodes[frame].attr("id") {
            Some(id) if !id.trim().is_empty() => FrameSelector::Id(id.to_string()),
            _ => FrameSelector::Path(self.css_path(frame)),
        }
    }

    /// Frames whose document the browser would not expose, in document order.
    /// Cross-origin frames land here unless web security is disabled.
    pub fn unreadable_frames(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| {
                let node = &self.nodes[id];
                node.is_frame() && node.attr("inaccessible").is_some()
            })
            .collect()
    }

    /// Frame-scoped locator for a node, built from its iframe path.
    pub fn locator(&self, id: NodeId) -> ElementLocator {
        ElementLocator {
            frames: self.nodes[id]
                .iframe_path
                .iter()
                .map(|&frame| self.frame_selector(frame))
                .collect(),
            selector: self.css_path(id),
        }
    }

    /// Evaluate a locator against this snapshot.
    ///
    /// Matching never crosses a frame boundary on its own: a selector without
    /// frames only sees the top-level document.
    pub fn locate(&self, locator: &ElementLocator) -> Option<NodeId> {
        let mut document = self.root()?;
        for frame in &locator.frames {
            let frame_node = self
                .document_nodes(document)
                .into_iter()
                .find(|&id| self.matches_frame(id, frame))?;
            document = *self.nodes[frame_node].children.first()?;
        }
        self.document_nodes(document)
            .into_iter()
            .find(|&id| self.css_path(id) == locator.selector)
    }

    fn matches_frame(&self, id: NodeId, selector: &FrameSelector) -> bool {
        let node = &self.nodes[id];
        if !node.is_frame() {
            return false;
        }
        match selector {
            FrameSelector::Id(frame_id) => node.attr("id") == Some(frame_id.as_str()),
            FrameSelector::Path(path) => self.css_path(id) == *path,
        }
    }

    /// Nodes of the document rooted at `root`, in pre-order, not entering frames.
    fn document_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let node = &self.nodes[id];
            if node.is_frame() {
                continue;
            }
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Text of a node and its descendants in the same document.
    fn visible_text(&self, id: NodeId, max: usize) -> String {
        let words: Vec<&str> = self
            .document_nodes(id)
            .into_iter()
            .map(|n| self.nodes[n].text.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        clip(&words.join(" "), max)
    }
}

/// An interactive element the executor can address by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementHandle {
    pub index: u32,
    pub node: NodeId,
    pub tag: String,
    pub locator: ElementLocator,
    /// `<tag attrs>text</tag>` rendering shown to the model.
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectorMap {
    handles: BTreeMap<u32, ElementHandle>,
}

impl SelectorMap {
    /// Walk the tree once and index every interactive node in traversal order.
    pub fn build(tree: &DomTree) -> Self {
        let mut handles = BTreeMap::new();
        for id in 0..tree.len() {
            if !tree.is_interactive(id) {
                continue;
            }
            let index = handles.len() as u32;
            let node = &tree.nodes[id];
            handles.insert(
                index,
                ElementHandle {
                    index,
                    node: id,
                    tag: node.tag.clone(),
                    locator: tree.locator(id),
                    label: render_label(tree, id),
                },
            );
        }
        Self { handles }
    }

    pub fn get(&self, index: u32) -> Option<&ElementHandle> {
        self.handles.get(&index)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementHandle> {
        self.handles.values()
    }
}

fn render_label(tree: &DomTree, id: NodeId) -> String {
    let node = &tree.nodes[id];
    let mut attrs = String::new();
    for name in LABEL_ATTRIBUTES {
        if let Some(value) = node.attr(name) {
            if !value.is_empty() {
                attrs.push_str(&format!(" {name}={:?}", clip(value, 40)));
            }
        }
    }
    let text = tree.visible_text(id, 80);
    format!("<{tag}{attrs}>{text}</{tag}>", tag = node.tag)
}

/// A captured page: the tree plus the selector map built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct DomSnapshot {
    pub url: String,
    pub title: String,
    pub tree: DomTree,
    pub selector_map: SelectorMap,
}

impl DomSnapshot {
    pub fn new(url: impl Into<String>, title: impl Into<String>, tree: DomTree) -> Self {
        let selector_map = SelectorMap::build(&tree);
        Self {
            url: url.into(),
            title: title.into(),
            tree,
            selector_map,
        }
    }

    pub fn resolve(&self, index: u32) -> Result<&ElementHandle, ResolveError> {
        self.selector_map
            .get(index)
            .ok_or(ResolveError::NotFound(index))
    }

    /// Element listing for the executor, one line per index.
    pub fn page_state(&self, max_chars: usize) -> PageState {
        let mut lines: Vec<String> = self
            .selector_map
            .iter()
            .map(|handle| {
                let depth = self.tree.nodes[handle.node].iframe_path.len();
                if depth == 0 {
                    format!("[{}]{}", handle.index, handle.label)
                } else {
                    format!("[{}]{} (inside {depth} frame(s))", handle.index, handle.label)
                }
            })
            .collect();
        for frame in self.tree.unreadable_frames() {
            let src = self.tree.nodes[frame].attr("src").unwrap_or("");
            lines.push(format!("(frame {src:?} could not be read; its elements are not listed)"));
        }
        PageState {
            url: self.url.clone(),
            title: self.title.clone(),
            elements: clip(&lines.join("\n"), max_chars),
            element_count: self.selector_map.len(),
            error: None,
        }
    }
}

/// Resolve `index` against a snapshot's selector map.
pub fn resolve(snapshot: &DomSnapshot, index: u32) -> Result<ElementHandle, ResolveError> {
    snapshot.resolve(index).cloned()
}

/// Reply shape of [`snapshot_script`].
#[derive(Debug, Deserialize)]
pub struct CaptureReply {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub root: RawNode,
}

impl CaptureReply {
    pub fn into_snapshot(self) -> DomSnapshot {
        DomSnapshot::new(self.url, self.title, DomTree::from_raw(self.root))
    }
}
