//! Narrow extraction helpers over selector strings.
//!
//! Only the handful of patterns the strategies need: quoted `:has-text(...)`
//! text, a leading class name, a leading tag name, and word tokens.

use std::sync::OnceLock;

use regex::Regex;

fn has_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i):has-text\(["'](.+?)["']\)"#).expect("static regex"))
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.([a-z-]+)").expect("static regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^([a-z][a-z0-9-]*)").expect("static regex"))
}

fn token_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex"))
}

/// Text inside `:has-text("...")`.
pub fn has_text(selector: &str) -> Option<String> {
    has_text_re()
        .captures(selector)
        .map(|c| c[1].to_string())
}

/// The first class name, hyphens turned into spaces (`.sign-in` -> `sign in`).
pub fn class_text(selector: &str) -> Option<String> {
    class_re()
        .captures(selector)
        .map(|c| c[1].replace('-', " ").trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Text an element is expected to carry: `:has-text` wins over a class name.
pub fn expected_text(selector: &str) -> Option<String> {
    has_text(selector).or_else(|| class_text(selector))
}

/// Leading tag name, lowercased.
///
/// Selector-engine prefixes such as `text="..."` or `css=...` are not tags.
pub fn tag_name(selector: &str) -> Option<String> {
    let m = tag_re().captures(selector)?.get(1)?;
    match selector[m.end()..].chars().next() {
        Some('=') | Some('*') => None,
        _ => Some(m.as_str().to_ascii_lowercase()),
    }
}

/// Lowercased word tokens. Splits on `-`, `_`, whitespace and any other
/// punctuation, so `#`, `.`, quotes and brackets never end up in a token.
pub fn tokens(s: &str) -> Vec<String> {
    token_split_re()
        .split(&s.to_lowercase())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when any token of `a` matches any token of `b`.
///
/// Tokens match when equal, or when one contains the other and the shorter
/// has at least three characters.
pub fn tokens_overlap(a: &str, b: &str) -> bool {
    let left = tokens(a);
    let right = tokens(b);
    left.iter().any(|l| right.iter().any(|r| token_match(l, r)))
}

fn token_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 3 && long.contains(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_text_extraction() {
        assert_eq!(has_text(r#"button:has-text("Log in")"#).as_deref(), Some("Log in"));
        assert_eq!(has_text("button:HAS-TEXT('Save')").as_deref(), Some("Save"));
        assert_eq!(has_text("#submit"), None);
    }

    #[test]
    fn test_class_text_extraction() {
        assert_eq!(class_text(".sign-in-button").as_deref(), Some("sign in button"));
        assert_eq!(class_text("button.primary").as_deref(), Some("primary"));
        assert_eq!(class_text("#submit-btn"), None);
    }

    #[test]
    fn test_expected_text_prefers_has_text() {
        assert_eq!(
            expected_text(r#"a.nav-link:has-text("Pricing")"#).as_deref(),
            Some("Pricing")
        );
        assert_eq!(expected_text(".nonexistent-thing").as_deref(), Some("nonexistent thing"));
        assert_eq!(expected_text("[data-id=\"7\"]"), None);
    }

    #[test]
    fn test_tag_name_extraction() {
        assert_eq!(tag_name("button.primary").as_deref(), Some("button"));
        assert_eq!(tag_name("H1").as_deref(), Some("h1"));
        assert_eq!(tag_name("input[name=\"q\"]").as_deref(), Some("input"));
        assert_eq!(tag_name("#submit"), None);
        assert_eq!(tag_name(".card"), None);
        assert_eq!(tag_name("text=\"Submit\""), None);
        assert_eq!(tag_name("text*=\"Sub\""), None);
    }

    #[test]
    fn test_tokens_strip_punctuation() {
        assert_eq!(tokens("#submit-btn"), vec!["submit", "btn"]);
        assert_eq!(tokens("[data-test=\"login_form\"]"), vec!["data", "test", "login", "form"]);
        assert!(tokens("--").is_empty());
    }

    #[test]
    fn test_token_overlap() {
        assert!(tokens_overlap("#submit-btn", "submit-btn"));
        assert!(tokens_overlap("#submit", "submit-button"));
        assert!(tokens_overlap(".checkout", "checkout-panel"));
        assert!(!tokens_overlap(".nonexistent-thing", "submit-btn"));
        // Two-letter fragments do not count as containment.
        assert!(!tokens_overlap("#go", "google-login"));
        assert!(tokens_overlap("#go", "go"));
    }
}
