//! Placeholder substitution for webhook bodies.
//!
//! Templates reference the event's `title` and `message` as `{{title}}` / `{{message}}`.
//! The dotted form `{{.title}}` is accepted too. Whitespace inside the braces is ignored.

use crate::error::TemplateError;
use crate::event::InboundEvent;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Named fields available to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub title: &'a str,
    pub message: &'a str,
}

impl<'a> TemplateContext<'a> {
    pub fn new(title: &'a str, message: &'a str) -> Self {
        Self { title, message }
    }

    fn lookup(&self, field: &str) -> Option<&'a str> {
        match field {
            "title" => Some(self.title),
            "message" => Some(self.message),
            _ => None,
        }
    }
}

impl<'a> From<&'a InboundEvent> for TemplateContext<'a> {
    fn from(event: &'a InboundEvent) -> Self {
        Self::new(&event.title, &event.message)
    }
}

/// Render `template` against `ctx`. Text outside placeholders is copied verbatim.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or(TemplateError::Unclosed(offset + start))?;
        let field = placeholder_field(&after_open[..end]);
        if field.is_empty() {
            return Err(TemplateError::EmptyPlaceholder(offset + start));
        }
        let value = ctx
            .lookup(field)
            .ok_or_else(|| TemplateError::UnknownField(field.to_string()))?;
        out.push_str(value);

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder_field(inner: &str) -> &str {
    let inner = inner.trim();
    inner.strip_prefix('.').unwrap_or(inner).trim()
}
