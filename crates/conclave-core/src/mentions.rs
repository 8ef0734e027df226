//! `@name` mention parsing

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::types::AgentId;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([\w-]+)").expect("valid mention regex"));

/// Extract the distinct handles mentioned in `text`
pub fn parse_mentions(text: &str) -> BTreeSet<AgentId> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}
