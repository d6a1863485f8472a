//! Mind maps: a validated node tree and its FreeMind (`.mm`) rendering.
//!
//! Backends describe a map as JSON:
//!
//! ```json
//! {"root": {"text": "Trip", "children": [
//!     {"text": "Flights", "priority": 1},
//!     {"text": "Hotel", "link": "https://example.com", "color": "#ff0000"}
//! ]}}
//! ```
//!
//! Nodes accept exactly `text`, `children`, `link`, `color` and `priority`.
//! `text` must be non-empty after trimming; `priority` may be an integer or
//! a string of digits.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MindMapError {
    #[error("mind map JSON could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid mind map: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MindMapNode {
    pub text: String,
    pub children: Vec<MindMapNode>,
    pub link: Option<String>,
    pub color: Option<String>,
    pub priority: Option<u32>,
}

impl MindMapNode {
    pub fn leaf(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            children: Vec::new(),
            link: None,
            color: None,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MindMap {
    pub root: MindMapNode,
}

// ============ Parsing ============

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMap {
    root: RawNode,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    text: Option<String>,
    children: Option<Vec<RawNode>>,
    link: Option<String>,
    color: Option<String>,
    priority: Option<RawPriority>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPriority {
    Number(u32),
    Text(String),
}

impl TryFrom<RawNode> for MindMapNode {
    type Error = MindMapError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let text = raw
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MindMapError::Invalid("each node must have non-empty 'text'".into()))?;

        let priority = match raw.priority {
            None => None,
            Some(RawPriority::Number(n)) => Some(n),
            Some(RawPriority::Text(s)) => Some(s.trim().parse::<u32>().map_err(|_| {
                MindMapError::Invalid(format!(
                    "'priority' must be an integer or a string of digits, got '{}'",
                    s
                ))
            })?),
        };

        let children = raw
            .children
            .unwrap_or_default()
            .into_iter()
            .map(MindMapNode::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            text,
            children,
            link: trimmed(raw.link),
            color: trimmed(raw.color),
            priority,
        })
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl MindMap {
    /// Parse and validate a `{"root": {...}}` document. A surrounding
    /// Markdown code fence is tolerated.
    pub fn from_json(raw: &str) -> Result<Self, MindMapError> {
        let raw: RawMap = serde_json::from_str(strip_code_fence(raw))?;
        Ok(Self {
            root: MindMapNode::try_from(raw.root)?,
        })
    }

    /// A root titled `title` with one branch per paragraph.
    pub fn from_paragraphs(title: &str, paragraphs: &[String]) -> Self {
        let title = title.trim();
        let mut root = MindMapNode::leaf(if title.is_empty() { "Mind map" } else { title });
        root.children = paragraphs
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(MindMapNode::leaf)
            .collect();
        if root.children.is_empty() {
            root.children.push(MindMapNode::leaf("No extractable content found."));
        }
        Self { root }
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        fn count(node: &MindMapNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    // ============ FreeMind ============

    pub fn to_freemind(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<map version=\"1.0.1\">\n");
        write_node(&mut out, &self.root, 2);
        out.push_str("</map>\n");
        out
    }
}

fn write_node(out: &mut String, node: &MindMapNode, indent: usize) {
    let pad = " ".repeat(indent);
    let mut attrs = vec![("TEXT", node.text.clone())];
    if let Some(link) = &node.link {
        attrs.push(("LINK", link.clone()));
    }
    if let Some(color) = &node.color {
        attrs.push(("COLOR", color.clone()));
    }
    if let Some(priority) = node.priority {
        attrs.push(("PRIORITY", priority.to_string()));
    }
    let attrs = attrs
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, escape_xml(value)))
        .collect::<Vec<_>>()
        .join(" ");

    if node.children.is_empty() {
        out.push_str(&format!("{}<node {}/>\n", pad, attrs));
        return;
    }
    out.push_str(&format!("{}<node {}>\n", pad, attrs));
    for child in &node.children {
        write_node(out, child, indent + 2);
    }
    out.push_str(&format!("{}</node>\n", pad));
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
    out
}

/// Models like to wrap JSON in ```` ```json ```` fences.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.split_once('\n').map_or("", |(_, rest)| rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
