//! Markdown bullet and numbered list parsing for array fields.

use std::sync::LazyLock;

use regex::Regex;

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s*[.)\]]\s*").expect("valid regex"));

/// Parses a markdown list into its item texts.
///
/// Accepts `-`, `*` and `+` bullets as well as `1.`, `1)` and `1]` numbering.
/// Non-list lines are tolerated only before the first item (a header such as
/// `Output 1:`). Anything else is rejected.
pub(crate) fn parse_markdown_list(input: &str) -> Result<Vec<String>, String> {
    let mut items = Vec::new();

    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix(['-', '*', '+']) {
            items.push(rest.trim().to_string());
        } else if let Some(m) = NUMBERED_ITEM.find(line) {
            items.push(line[m.end()..].trim().to_string());
        } else if items.is_empty() {
            continue;
        } else {
            return Err("Could not parse markdown list: mixed content detected".to_string());
        }
    }

    if items.is_empty() {
        return Err("Could not parse markdown list: no list items found".to_string());
    }
    Ok(items)
}
