//! Heuristic confidence for a selector, by the kind of hook it relies on.
//!
//! Used for analytics on healed selectors; the healing chain itself does not
//! consult it. Scores fall in the same order as strategy priority.

pub const DATA_TEST: f64 = 0.95;
pub const ARIA: f64 = 0.8;
pub const ID: f64 = 0.7;
pub const TEXT: f64 = 0.6;
pub const CLASS: f64 = 0.4;
pub const TAG: f64 = 0.2;

/// Score `selector` by the most stable hook it contains.
pub fn selector_confidence(selector: &str) -> f64 {
    let s = selector.trim().to_ascii_lowercase();
    if s.contains("[data-test") || s.contains("[data-cy") {
        DATA_TEST
    } else if s.contains("[aria-") || s.contains("[role") || s.starts_with("role=") {
        ARIA
    } else if s.starts_with('#') || (s.contains('#') && !s.contains('"')) {
        ID
    } else if s.starts_with("text=") || s.starts_with("text*=") || s.contains(":has-text(") {
        TEXT
    } else if s.contains('.') {
        CLASS
    } else {
        TAG
    }
}
