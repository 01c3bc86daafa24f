//! Canonical expression text.
//!
//! Rules, applied in a single left-to-right scan:
//! 1. Whitespace outside quoted literals is dropped.
//! 2. Quoted spans (`'...'` or `"..."`, backslash escapes honoured) are
//!    copied verbatim, including any whitespace or semicolons inside them.
//! 3. Every unquoted `;` is followed by exactly one `\n`.
//! 4. The result is trimmed.
//!
//! The output is a fixed point: `normalize(normalize(x)) == normalize(x)`.

/// Canonicalize raw expression text.
pub fn normalize(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in expression.chars() {
        if let Some(q) = quote {
            out.push(c);
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
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            ';' => out.push_str(";\n"),
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }

    trim_outside_quotes(out)
}

/// Trim leading/trailing whitespace. Leading whitespace can never be quoted
/// content; trailing whitespace can only be quoted content when a literal is
/// left unterminated, in which case it is kept.
fn trim_outside_quotes(mut s: String) -> String {
    let unterminated = has_unterminated_quote(&s);
    if !unterminated {
        let end = s.trim_end().len();
        s.truncate(end);
    }
    let start = s.len() - s.trim_start().len();
    if start > 0 {
        s.drain(..start);
    }
    s
}

fn has_unterminated_quote(s: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in s.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
            }
        }
    }
    quote.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_whitespace() {
        assert_eq!(normalize("  ts_mean( close , 20 )  "), "ts_mean(close,20)");
    }

    #[test]
    fn semicolons_become_line_breaks() {
        assert_eq!(
            normalize("a = rank(close);   b = ts_mean(a, 5);\n\n b"),
            "a=rank(close);\nb=ts_mean(a,5);\nb"
        );
    }

    #[test]
    fn trailing_semicolon_keeps_no_newline() {
        assert_eq!(normalize("rank(close);  "), "rank(close);");
    }

    #[test]
    fn quoted_spans_are_verbatim() {
        let e = r#"bucket(rank(cap), range = "0.1, 1; 0.1")"#;
        assert_eq!(normalize(e), r#"bucket(rank(cap),range="0.1, 1; 0.1")"#);

        let single = "trade_when(x, y, 'a b ;  c')";
        assert_eq!(normalize(single), "trade_when(x,y,'a b ;  c')");
    }

    #[test]
    fn escaped_quote_does_not_close_literal() {
        let e = r#"f("a \" ; b", c)"#;
        assert_eq!(normalize(e), r#"f("a \" ; b",c)"#);
    }

    #[test]
    fn mixed_quotes_nest_as_text() {
        let e = r#"f("it's ; fine", 'say "hi" ')"#;
        assert_eq!(normalize(e), r#"f("it's ; fine",'say "hi" ')"#);
    }

    #[test]
    fn idempotent_on_examples() {
        for e in [
            "a ; b ;",
            " x = 1;\n\ty = 'q ; r' ; x + y ",
            "f(\"unterminated  ",
            "",
            ";;;",
        ] {
            let once = normalize(e);
            assert_eq!(normalize(&once), once, "not a fixed point for {e:?}");
        }
    }

    #[test]
    fn unterminated_literal_keeps_its_trailing_space() {
        assert_eq!(normalize("f(\"abc  "), "f(\"abc  ");
    }
}
