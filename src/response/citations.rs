//! Removal of document-citation markup from assistant answers

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `【4:0†source】` file-search annotations and bare `[1]` / `[2:3]` references,
    /// together with the whitespace in front of them
    static ref CITATION: Regex =
        Regex::new(r"\s*(?:【[^】]*】|\[\d+(?::\d+)?(?:†[^\]]*)?\])").expect("valid citation regex");
}

/// Strip bracketed reference annotations so they are never spoken
pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").trim().to_string()
}
