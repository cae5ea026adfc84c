//! Rich-text clean-up applied before content is stored or re-rendered.
//!
//! Two classes of corruption are removed:
//! - runs of three or more identical letters inside a word, left behind by
//!   broken paste operations ("Thhhe" becomes "The");
//! - empty `p`, `h1`-`h6` and `div` elements, including ones holding only
//!   whitespace, `&nbsp;` or `<br>` tags.
//!
//! Markup and character entities are never rewritten by the letter pass, so
//! attribute values, URLs and `&...;` references survive untouched. The letter pass is a heuristic and can
//! damage legitimate text such as onomatopoeia ("zzz"); see DESIGN.md.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static EMPTY_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)<(p|h[1-6]|div)(?:\s[^>]*)?>(?:\s|&nbsp;|&#160;|<br\s*/?>)*</(p|h[1-6]|div)\s*>",
    )
    .expect("valid empty block regex")
});

static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#?[A-Za-z0-9]+;").expect("valid entity regex"));

/// Form keys that carry rich text and go through [`sanitize_html`].
pub const RICH_TEXT_FIELDS: &[&str] = &["content", "body", "excerpt", "description"];

/// Sanitize an HTML fragment. Idempotent: both passes only ever shrink the
/// input, and they are repeated until neither changes anything.
pub fn sanitize_html(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = collapse_repeated_letters(&remove_empty_blocks(&current));
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Normalise a submitted form: rich-text fields are sanitized, every other
/// field is trimmed.
pub fn sanitize_form(form: &mut BTreeMap<String, String>) {
    for (key, value) in form.iter_mut() {
        if RICH_TEXT_FIELDS.contains(&key.as_str()) {
            *value = sanitize_html(value);
        } else {
            *value = value.trim().to_string();
        }
    }
}

/// Drop empty block elements until none remain, so nested empties such as
/// `<div><p></p></div>` disappear completely.
pub fn remove_empty_blocks(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = EMPTY_BLOCK
            .replace_all(&current, |caps: &Captures| {
                if caps[1].eq_ignore_ascii_case(&caps[2]) {
                    String::new()
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Collapse runs of 3+ identical letters in text nodes. Tags are copied
/// verbatim and act as word boundaries.
pub fn collapse_repeated_letters(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut text = String::new();
    let mut in_tag = false;

    for ch in input.chars() {
        if in_tag {
            out.push(ch);
            if ch == '>' {
                in_tag = false;
            }
            continue;
        }
        if ch == '<' {
            out.push_str(&collapse_text(&text));
            text.clear();
            out.push(ch);
            in_tag = true;
            continue;
        }
        text.push(ch);
    }
    out.push_str(&collapse_text(&text));
    out
}

fn collapse_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut token = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() {
            out.push_str(&collapse_token(&token));
            token.clear();
            out.push(ch);
        } else {
            token.push(ch);
        }
    }
    out.push_str(&collapse_token(&token));
    out
}

fn collapse_token(token: &str) -> String {
    if token.is_empty() || is_url_like(token) || is_all_caps(token) {
        return token.to_string();
    }

    let mut out = String::with_capacity(token.len());
    let mut rest = 0;
    for entity in ENTITY.find_iter(token) {
        out.push_str(&collapse_run(&token[rest..entity.start()]));
        out.push_str(entity.as_str());
        rest = entity.end();
    }
    out.push_str(&collapse_run(&token[rest..]));
    out
}

fn collapse_run(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();
    while let Some(ch) = chars.next() {
        let mut run = 1;
        while chars.peek() == Some(&ch) {
            chars.next();
            run += 1;
        }
        if ch.is_alphabetic() && run >= 3 {
            out.push(ch);
        } else {
            out.extend(std::iter::repeat(ch).take(run));
        }
    }
    out
}

fn is_url_like(token: &str) -> bool {
    token.contains("://") || token.to_ascii_lowercase().starts_with("www.")
}

// Acronyms and roman numerals ("III", "XXX").
fn is_all_caps(token: &str) -> bool {
    let mut letters = token.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_tripled_letters() {
        assert_eq!(sanitize_html("<p>Thhhe reeeport</p>"), "<p>The report</p>");
        assert_eq!(sanitize_html("sooooo"), "so");
    }

    #[test]
    fn keeps_doubled_letters() {
        let text = "<p>Mississippi committee bookkeeper</p>";
        assert_eq!(sanitize_html(text), text);
    }

    #[test]
    fn leaves_markup_and_urls_alone() {
        let html = r#"<a href="https://www.example.com/aaa-report">see www.example.com/aaa</a>"#;
        assert_eq!(sanitize_html(html), html);
    }

    #[test]
    fn leaves_acronyms_and_digits() {
        assert_eq!(sanitize_html("World War III in 1000 days"), "World War III in 1000 days");
    }

    #[test]
    fn tags_break_runs() {
        assert_eq!(sanitize_html("aa<b>a</b>"), "aa<b>a</b>");
    }

    #[test]
    fn removes_empty_blocks() {
        assert_eq!(sanitize_html("<p></p><h2> </h2><p>Body</p>"), "<p>Body</p>");
        assert_eq!(sanitize_html("<p><br></p><div>&nbsp;<br/> </div>x"), "x");
        assert_eq!(sanitize_html(r#"<p class="x"><br /></p>"#), "");
    }

    #[test]
    fn removes_nested_empty_blocks() {
        assert_eq!(sanitize_html("<div><p></p><h3></h3></div><p>ok</p>"), "<p>ok</p>");
    }

    #[test]
    fn keeps_non_empty_and_mismatched() {
        assert_eq!(sanitize_html("<p><img src=\"a.png\"></p>"), "<p><img src=\"a.png\"></p>");
        assert_eq!(sanitize_html("<p></div>"), "<p></div>");
    }

    #[test]
    fn idempotent_on_mixed_input() {
        let inputs = [
            "<p>Thhhe</p><p></p><div><br></div>Geeeopolitics",
            "aa<p></p>a",
            "<h1>  </h1><p>Mississippi   baaad wwwww.x</p>",
            "<div><div><p><br></p></div></div>tail",
            "<p>Intro</p><p>&nnnbsp;</p><p>Body</p>",
            "<p>nnn&nbsp;</p><p>x</p>",
        ];
        for input in inputs {
            let once = sanitize_html(input);
            assert_eq!(sanitize_html(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn entities_are_left_alone() {
        assert_eq!(
            sanitize_html("<p>Intro</p><p>&nnnbsp;</p><p>Body</p>"),
            "<p>Intro</p><p>&nnnbsp;</p><p>Body</p>"
        );
        assert_eq!(sanitize_html("Rock&amp;rolll"), "Rock&amp;rol");
    }

    #[test]
    fn form_normalisation_matches_client_path() {
        let mut form = BTreeMap::new();
        form.insert("title".to_string(), "  Outlook  ".to_string());
        form.insert("content".to_string(), "<p>Thhhe</p><p></p>".to_string());
        sanitize_form(&mut form);
        assert_eq!(form["title"], "Outlook");
        assert_eq!(form["content"], sanitize_html("<p>Thhhe</p><p></p>"));
        assert_eq!(form["content"], "<p>The</p>");
    }
}
