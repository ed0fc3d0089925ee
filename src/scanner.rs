//! Locating include tags in page content.
//!
//! Recognizes `<ableron-include …/>` and
//! `<ableron-include …>fallback</ableron-include>` with the dot matching
//! newlines inside the fallback body. Scanning starts at the first literal
//! occurrence of the tag name, so pages without includes cost a substring
//! search and nothing more.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::include::Include;

const INCLUDE_TAG_START: &str = "<ableron-include";

static INCLUDE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"<ableron-include\s((?:[^">]|"[^"]*")*?)(/>|>((?s:.)*?)</ableron-include>)"#,
    )
    .expect("include tag pattern is valid")
});

static ATTRIBUTE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_0-9-]+)(?:="([^"]*)")?"#)
        .expect("attribute pattern is valid")
});

/// Extracts the unique includes of the given content in document order.
/// Tags with identical raw text collapse into one logical include.
pub(crate) fn find_includes(content: &str) -> Vec<Include> {
    let Some(first_tag) = content.find(INCLUDE_TAG_START) else {
        return Vec::new();
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut includes = Vec::new();
    for captures in INCLUDE_PATTERN.captures_iter(&content[first_tag..]) {
        let raw_tag = match captures.get(0) {
            Some(tag) => tag.as_str(),
            None => continue,
        };
        if !seen.insert(raw_tag) {
            continue;
        }
        let attributes =
            parse_attributes(captures.get(1).map_or("", |m| m.as_str()));
        let fallback_content =
            captures.get(3).map(|body| body.as_str().to_string());
        includes.push(Include::new(
            raw_tag.to_string(),
            attributes,
            fallback_content,
        ));
    }
    includes
}

/// Parses an attribute list into name/value pairs. Bare attributes yield
/// empty string values.
fn parse_attributes(attributes: &str) -> Vec<(String, String)> {
    ATTRIBUTE_PATTERN
        .captures_iter(attributes)
        .filter_map(|captures| {
            let name = captures.get(1)?.as_str().to_string();
            let value = captures
                .get(2)
                .map_or_else(String::new, |m| m.as_str().to_string());
            Some((name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_without_includes() {
        assert!(find_includes("<html><body>plain</body></html>").is_empty());
        assert!(find_includes("").is_empty());
        // The tag name alone, without whitespace and attributes, is not a tag
        assert!(find_includes("<ableron-include/>").is_empty());
    }

    #[test]
    fn self_closing_tag() {
        let includes =
            find_includes(r#"pre <ableron-include src="http://h/a"/> post"#);
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].src(), Some("http://h/a"));
        assert_eq!(includes[0].fallback_content(), "");
        assert_eq!(
            includes[0].raw_tag(),
            r#"<ableron-include src="http://h/a"/>"#
        );
    }

    #[test]
    fn tag_with_fallback_body() {
        let includes = find_includes(
            r#"<ableron-include src="http://h/a">FB</ableron-include>"#,
        );
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].fallback_content(), "FB");
    }

    #[test]
    fn fallback_body_may_span_lines() {
        let includes = find_includes(
            "<ableron-include src=\"http://h/a\">line1\nline2\n</ableron-include>",
        );
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].fallback_content(), "line1\nline2\n");
    }

    #[test]
    fn attributes_may_be_separated_by_line_breaks_and_tabs() {
        let includes = find_includes(
            "<ableron-include\n\tsrc=\"http://h/a\"\n\tfallback-src=\"http://h/b\"\n\tprimary/>",
        );
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].src(), Some("http://h/a"));
        assert_eq!(includes[0].fallback_src(), Some("http://h/b"));
        assert!(includes[0].is_primary());
    }

    #[test]
    fn quoted_values_may_contain_slash_and_gt() {
        let includes = find_includes(
            r#"<ableron-include src="http://h/a?x=1>2&y=/z"/>"#,
        );
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].src(), Some("http://h/a?x=1>2&y=/z"));
    }

    #[test]
    fn duplicate_tags_collapse_into_one_include() {
        let tag = r#"<ableron-include src="http://h/a"/>"#;
        let includes = find_includes(&format!("{tag} middle {tag} end {tag}"));
        assert_eq!(includes.len(), 1);
    }

    #[test]
    fn distinct_tags_keep_document_order() {
        let includes = find_includes(
            r#"<ableron-include src="http://h/b"/><ableron-include src="http://h/a"/>"#,
        );
        assert_eq!(includes.len(), 2);
        assert_eq!(includes[0].src(), Some("http://h/b"));
        assert_eq!(includes[1].src(), Some("http://h/a"));
    }

    #[test]
    fn unclosed_tag_is_ignored() {
        assert!(find_includes(r#"<ableron-include src="http://h/a">"#)
            .is_empty());
    }

    #[test]
    fn bare_attributes_have_empty_values() {
        let attributes = parse_attributes(r#"primary src="http://h/a""#);
        assert_eq!(
            attributes,
            vec![
                ("primary".to_string(), String::new()),
                ("src".to_string(), "http://h/a".to_string()),
            ]
        );
    }

    #[test]
    fn nested_include_markup_inside_fallback_is_not_recursed_into() {
        // The scanner stops the fallback body at the first closing tag;
        // whatever remains is plain page content
        let includes = find_includes(
            r#"<ableron-include src="http://h/a">x</ableron-include><ableron-include src="http://h/b">y</ableron-include>"#,
        );
        assert_eq!(includes.len(), 2);
        assert_eq!(includes[0].fallback_content(), "x");
        assert_eq!(includes[1].fallback_content(), "y");
    }
}
