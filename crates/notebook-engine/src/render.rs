use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellKind};
use crate::input::InputRequest;

/// What the page draws under a cell.
/// TypeScript receives this as JSON and renders it to DOM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RenderSpec {
    /// Streamed output and the echoed result.
    #[serde(rename = "text")]
    Text { content: String },

    /// Error message.
    #[serde(rename = "error")]
    Error { message: String },

    /// Markup from `%%html` or a rendered data frame.
    #[serde(rename = "html")]
    Html { content: String },

    /// A base64 PNG figure.
    #[serde(rename = "image")]
    Image { data: String },

    /// Source of a markdown cell; the page renders it.
    #[serde(rename = "markdown")]
    Markdown { content: String },

    /// The cell is waiting on a line of input.
    #[serde(rename = "input_prompt")]
    InputPrompt {
        prompt: String,
        title: Option<String>,
    },

    /// Multiple specs stacked vertically.
    #[serde(rename = "vstack")]
    VStack { children: Vec<RenderSpec> },
}

impl RenderSpec {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self::Html {
            content: content.into(),
        }
    }

    pub fn vstack(children: Vec<RenderSpec>) -> Self {
        Self::VStack { children }
    }

    /// Serialize for the page; never fails outward.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","message":{}}}"#,
                serde_json::Value::String(format!("Serialization error: {e}"))
            )
        })
    }
}

/// Output area for one cell. `pending` is the open input request, if any.
pub fn render_cell(cell: &Cell, pending: Option<&InputRequest>) -> RenderSpec {
    if cell.kind == CellKind::Markdown {
        return RenderSpec::Markdown {
            content: cell.source.clone(),
        };
    }
    let output = &cell.output;
    let mut children = Vec::new();
    if !output.text.is_empty() {
        children.push(RenderSpec::text(output.text.clone()));
    }
    if let Some(request) = pending.filter(|r| r.cell_id == cell.id) {
        children.push(RenderSpec::InputPrompt {
            prompt: request.prompt.clone(),
            title: request.title.clone(),
        });
    }
    if let Some(html) = &output.html {
        children.push(RenderSpec::html(html.clone()));
    }
    children.extend(output.images.iter().map(|data| RenderSpec::Image { data: data.clone() }));
    if let Some(error) = &output.error {
        children.push(RenderSpec::error(error.clone()));
    }
    RenderSpec::vstack(children)
}
