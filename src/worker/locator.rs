//! Finding the claim control for an item on a page snapshot.
//!
//! A page is a tree of elements. Pages are laid out differently from day to
//! day, so several strategies are tried in priority order. Each one first
//! finds an *anchor* (an element that clearly belongs to the item) and then
//! searches outward through the anchor's ancestors for an actionable control
//! whose label reads like a claim verb.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::feed::FeedItem;
use crate::errors::WorkerError;

static CLAIM_VERB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(buy|contact|purchase|view|get|claim)\b").unwrap());

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());

/// How many ancestors above the anchor are searched.
pub const MAX_ANCESTOR_DEPTH: usize = 6;

pub type NodeId = usize;

/// Element as it appears in a serialized page snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementSpec {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub children: Vec<ElementSpec>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Page snapshot stored as an arena of nodes; node 0 is the root.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Document {
    pub fn parse(json: &str) -> Result<Self, WorkerError> {
        let root: ElementSpec = serde_json::from_str(json)
            .map_err(|e| WorkerError::Browser(format!("malformed page snapshot: {}", e)))?;
        Ok(Self::from_spec(root))
    }

    pub fn from_spec(root: ElementSpec) -> Self {
        let mut doc = Document { nodes: Vec::new() };
        doc.push(root, None);
        doc
    }

    fn push(&mut self, spec: ElementSpec, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            tag: spec.tag.to_lowercase(),
            attrs: spec
                .attrs
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            text: spec.text,
            parent,
            children: Vec::new(),
        });
        for child in spec.children {
            let child_id = self.push(child, Some(id));
            self.nodes[id].children.push(child_id);
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    /// `id` and all its descendants, in document order.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.iter().rev());
        }
        out
    }

    /// Concatenated text of a node and its descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        self.subtree(id)
            .into_iter()
            .map(|n| self.nodes[n].text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether any text or attribute value anywhere in the page mentions `needle`
    /// as a whole token.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.trim();
        if needle.is_empty() {
            return false;
        }
        self.nodes.iter().any(|n| {
            has_token(&n.text, needle) || n.attrs.values().any(|v| has_token(v, needle))
        })
    }

    /// Path from the root, e.g. `body > div[2] > button[0]`, used in logs.
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &self.nodes[n];
            let index = node
                .parent
                .map(|p| {
                    self.nodes[p]
                        .children
                        .iter()
                        .position(|c| *c == n)
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            parts.push(format!("{}[{}]", node.tag, index));
            cur = node.parent;
        }
        parts.reverse();
        parts.join(" > ")
    }
}

fn has_token(haystack: &str, needle: &str) -> bool {
    NON_ALNUM.split(haystack).any(|t| t == needle)
}

/// An actionable element that claims an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub node: NodeId,
    pub label: String,
    pub href: Option<String>,
    pub path: String,
    /// Strategy that found it.
    pub strategy: &'static str,
}

pub trait LocatorStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Elements that identify the item on the page, best first.
    fn anchors(&self, doc: &Document, item: &FeedItem) -> Vec<NodeId>;
}

/// A `data-*` attribute whose value is the item id.
pub struct AnchorAttribute;

impl LocatorStrategy for AnchorAttribute {
    fn name(&self) -> &'static str {
        "anchor_attribute"
    }

    fn anchors(&self, doc: &Document, item: &FeedItem) -> Vec<NodeId> {
        doc.ids()
            .filter(|&n| {
                doc.node(n)
                    .attrs
                    .iter()
                    .any(|(k, v)| k.starts_with("data-") && v.trim() == item.id)
            })
            .collect()
    }
}

/// A link whose target carries the item id as a path or query token.
pub struct AnchorLink;

impl LocatorStrategy for AnchorLink {
    fn name(&self) -> &'static str {
        "anchor_link"
    }

    fn anchors(&self, doc: &Document, item: &FeedItem) -> Vec<NodeId> {
        doc.ids()
            .filter(|&n| {
                doc.node(n)
                    .attrs
                    .get("href")
                    .is_some_and(|href| has_token(href, &item.id))
            })
            .collect()
    }
}

/// An element whose own text is the item's title.
pub struct AnchorTitle;

impl LocatorStrategy for AnchorTitle {
    fn name(&self) -> &'static str {
        "anchor_title"
    }

    fn anchors(&self, doc: &Document, item: &FeedItem) -> Vec<NodeId> {
        let title = item.title.trim().to_lowercase();
        if title.is_empty() {
            return Vec::new();
        }
        doc.ids()
            .filter(|&n| doc.node(n).text.trim().to_lowercase().contains(&title))
            .collect()
    }
}

/// Strategies in priority order plus the outward control search.
pub struct Locator {
    strategies: Vec<Box<dyn LocatorStrategy>>,
}

impl Default for Locator {
    fn default() -> Self {
        Self::new(vec![
            Box::new(AnchorAttribute),
            Box::new(AnchorLink),
            Box::new(AnchorTitle),
        ])
    }
}

impl Locator {
    pub fn new(strategies: Vec<Box<dyn LocatorStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn locate(&self, doc: &Document, item: &FeedItem) -> Option<Control> {
        for strategy in &self.strategies {
            for anchor in strategy.anchors(doc, item) {
                if let Some(node) = find_control_near(doc, anchor) {
                    let control = Control {
                        node,
                        label: control_label(doc, node),
                        href: doc.node(node).attrs.get("href").cloned(),
                        path: doc.path(node),
                        strategy: strategy.name(),
                    };
                    tracing::debug!(item = %item.id, strategy = strategy.name(), path = %control.path, "Located claim control");
                    return Some(control);
                }
            }
        }
        None
    }
}

/// Search the anchor's subtree, then each ancestor's subtree, for a control.
///
/// Once an ancestor holds controls under more than one of its children it
/// spans several items, and the search gives up rather than guess.
fn find_control_near(doc: &Document, anchor: NodeId) -> Option<NodeId> {
    if let Some(found) = doc
        .subtree(anchor)
        .into_iter()
        .find(|&n| is_claim_control(doc, n))
    {
        return Some(found);
    }

    let mut scope = doc.node(anchor).parent;
    let mut depth = 1;
    while let Some(root) = scope {
        if depth > MAX_ANCESTOR_DEPTH {
            break;
        }
        if is_claim_control(doc, root) {
            return Some(root);
        }
        let branches: Vec<NodeId> = doc
            .node(root)
            .children
            .iter()
            .copied()
            .filter_map(|child| {
                doc.subtree(child)
                    .into_iter()
                    .find(|&n| is_claim_control(doc, n))
            })
            .collect();
        match branches.as_slice() {
            [] => {}
            [only] => return Some(*only),
            _ => return None,
        }
        depth += 1;
        scope = doc.node(root).parent;
    }
    None
}

fn is_actionable(node: &Node) -> bool {
    if node.attrs.contains_key("disabled") {
        return false;
    }
    matches!(node.tag.as_str(), "a" | "button" | "input")
        || node.attrs.get("role").is_some_and(|r| r == "button")
}

fn control_label(doc: &Document, id: NodeId) -> String {
    let node = doc.node(id);
    let text = doc.text_content(id);
    if !text.is_empty() {
        return text;
    }
    ["aria-label", "value", "title"]
        .iter()
        .find_map(|k| node.attrs.get(*k).cloned())
        .unwrap_or_default()
}

fn is_claim_control(doc: &Document, id: NodeId) -> bool {
    is_actionable(doc.node(id)) && CLAIM_VERB.is_match(&control_label(doc, id))
}
