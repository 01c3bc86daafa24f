//! Expression text: template compilation, canonical form, and pre-persistence checks.

pub mod compile;
pub mod normalize;

pub use compile::{compile, CompiledTemplate, Segment};
pub use normalize::normalize;

use thiserror::Error;

/// Errors raised while turning a template + bindings into an expression.
///
/// All of these are validation failures: the binding is rejected before
/// persistence and generation continues with the next one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("slot `{slot}` has no binding in template `{template}`")]
    UnboundSlot { slot: String, template: String },

    #[error("expression is empty")]
    Empty,

    #[error("unbalanced parentheses in `{0}`")]
    UnbalancedParentheses(String),

    #[error("expression exceeds {max} characters ({len})")]
    TooLong { len: usize, max: usize },
}

/// Structural sanity checks on a canonical expression.
///
/// Parentheses inside quoted literals are not counted.
pub fn validate(expression: &str, max_len: usize) -> Result<(), ExpressionError> {
    if expression.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }
    let len = expression.chars().count();
    if len > max_len {
        return Err(ExpressionError::TooLong { len, max: max_len });
    }

    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in expression.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ExpressionError::UnbalancedParentheses(expression.to_string()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ExpressionError::UnbalancedParentheses(expression.to_string()));
    }
    Ok(())
}
