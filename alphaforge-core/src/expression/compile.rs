//! Template compilation: `<name/>` tags become named substitution slots.
//!
//! Compilation never fails. Anything that does not look like a well-formed
//! tag (`<` + `[A-Za-z0-9_]+` + optional whitespace + `/>`) passes through as
//! literal text; a malformed tag simply has nothing to bind at render time.
//! Literal closing markers `</>` and the whitespace that follows them are
//! stripped.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use super::ExpressionError;

fn tag_re() -> &'static Regex {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    TAG_RE.get_or_init(|| Regex::new(r"<([A-Za-z0-9_]+)\s*/>").expect("tag pattern is valid"))
}

fn close_tag_re() -> &'static Regex {
    static CLOSE_TAG_RE: OnceLock<Regex> = OnceLock::new();
    CLOSE_TAG_RE.get_or_init(|| Regex::new(r"</>\s*").expect("close tag pattern is valid"))
}

/// A piece of a compiled template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Slot(String),
}

/// Template split into literal text and named slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Compile a tag-annotated template.
pub fn compile(template: &str) -> CompiledTemplate {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in tag_re().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_literal(&mut segments, &template[last..whole.start()]);
        segments.push(Segment::Slot(name.as_str().to_string()));
        last = whole.end();
    }
    push_literal(&mut segments, &template[last..]);

    CompiledTemplate {
        source: template.to_string(),
        segments,
    }
}

fn push_literal(segments: &mut Vec<Segment>, raw: &str) {
    let text = close_tag_re().replace_all(raw, "");
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Literal(prev)) = segments.last_mut() {
        prev.push_str(&text);
    } else {
        segments.push(Segment::Literal(text.into_owned()));
    }
}

impl CompiledTemplate {
    /// Original tagged text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Distinct slot names in order of first appearance.
    pub fn slots(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Slot(name) = seg {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
        }
        out
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Slot(n) if n == name))
    }

    /// Fill every slot from `bindings`. Extra bindings are ignored.
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> Result<String, ExpressionError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) => {
                    let value = bindings.get(name).ok_or_else(|| ExpressionError::UnboundSlot {
                        slot: name.clone(),
                        template: self.source.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Keyword-format rendering: slots shown as `{name}`.
impl fmt::Display for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => f.write_str(text)?,
                Segment::Slot(name) => write!(f, "{{{name}}}")?,
            }
        }
        Ok(())
    }
}
