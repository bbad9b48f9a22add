//! Webhook payload construction.
//!
//! A body template is either structured (it parses as JSON, scalars included) or plain
//! text. Structured templates have every string leaf rendered and are re-serialized;
//! plain templates are rendered as a whole. The decision is made on the template itself,
//! never on the rendered output.

use serde_json::Value;

use crate::error::TemplateError;
use crate::event::InboundEvent;
use crate::template::{render, TemplateContext};

/// A body template classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyTemplate<'a> {
    Structured(Value),
    Plain(&'a str),
}

impl<'a> BodyTemplate<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(tree) => BodyTemplate::Structured(tree),
            Err(_) => BodyTemplate::Plain(raw),
        }
    }

    /// Render against `ctx`, producing the request body.
    pub fn render(self, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
        match self {
            BodyTemplate::Structured(mut tree) => {
                render_leaves(&mut tree, ctx)?;
                Ok(serde_json::to_string(&tree)?)
            }
            BodyTemplate::Plain(text) => render(text, ctx),
        }
    }
}

/// Render every string leaf of `value` in place. Keys and non-string scalars are left alone.
/// Stops at the first failing leaf.
pub fn render_leaves(value: &mut Value, ctx: &TemplateContext<'_>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            *s = render(s, ctx)?;
        }
        Value::Array(items) => {
            for item in items {
                render_leaves(item, ctx)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                render_leaves(v, ctx)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Build the request body for `event` from a raw body template.
pub fn build_payload(raw: &str, event: &InboundEvent) -> Result<String, TemplateError> {
    BodyTemplate::parse(raw).render(&TemplateContext::from(event))
}
