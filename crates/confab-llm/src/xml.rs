//! Splitting free-form completions into tagged sections.
//!
//! Whitespace is preserved so the original text can be recovered when a
//! section fails to parse. Mode tags inside code fences and inline code are
//! treated as literal text.

/// Split `completion` into `(mode, text)` sections delimited by `<mode>` /
/// `</mode>` tags, for the given set of modes.
///
/// A closing tag always switches back to the default; an unclosed tag runs to
/// the end (the completion was probably cut). Untagged text takes
/// `default_mode`, or is discarded when there is none.
pub fn split_xml(
    completion: &str,
    modes: &[&str],
    default_mode: Option<&str>,
) -> Vec<(String, String)> {
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    let mut partial_mode: Option<String> = None;
    let mut partial_text = String::new();

    let mut in_fence = false;
    let mut in_inline_code = false;

    let bytes = completion.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        let rest = &completion[index..];

        // Code fences and inline code hide mode tags.
        if rest.starts_with("```") {
            in_fence = !in_fence;
            in_inline_code = false;
            partial_text.push_str("```");
            index += 3;
            continue;
        }
        if !in_fence && rest.starts_with('`') {
            in_inline_code = !in_inline_code;
            partial_text.push('`');
            index += 1;
            continue;
        }
        if in_inline_code && rest.starts_with('\n') {
            in_inline_code = false; // Inline code does not span lines.
        }

        if !in_fence && !in_inline_code && rest.starts_with('<') {
            if let Some((tag, closing, len)) = match_tag(rest, modes) {
                // Tags commit the partial text and switch the mode.
                // Whitespace between subsequent tags is discarded.
                if !partial_text.trim().is_empty() || partial_mode.is_some() {
                    sections.push((partial_mode.clone(), std::mem::take(&mut partial_text)));
                }
                partial_text.clear();
                partial_mode = (!closing).then(|| tag.to_string());
                index += len;
                continue;
            }
        }

        let ch = rest.chars().next().expect("non-empty rest");
        partial_text.push(ch);
        index += ch.len_utf8();
    }

    if !partial_text.trim().is_empty() {
        sections.push((partial_mode, partial_text));
    }

    sections
        .into_iter()
        .filter_map(|(mode, text)| {
            let mode = mode.or_else(|| default_mode.map(str::to_string))?;
            Some((mode, text))
        })
        .collect()
}

fn match_tag<'a>(rest: &str, modes: &[&'a str]) -> Option<(&'a str, bool, usize)> {
    for mode in modes {
        let open = format!("<{mode}>");
        if rest.starts_with(&open) {
            return Some((mode, false, open.len()));
        }
        let close = format!("</{mode}>");
        if rest.starts_with(&close) {
            return Some((mode, true, close.len()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tagged_sections() {
        let completion = "<think>\nreasoning\n</think>\nThe answer is 42.";
        let sections = split_xml(completion, &["think"], Some("text"));
        assert_eq!(
            sections,
            vec![
                ("think".to_string(), "\nreasoning\n".to_string()),
                ("text".to_string(), "\nThe answer is 42.".to_string()),
            ]
        );
    }

    #[test]
    fn unclosed_tag_runs_to_the_end() {
        let completion = "prefix <tool-calls>\n- name: echo";
        let sections = split_xml(completion, &["tool-calls"], Some("text"));
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].0, "tool-calls");
        assert_eq!(sections[1].1, "\n- name: echo");
    }

    #[test]
    fn tags_inside_code_blocks_are_literal() {
        let completion = "Use this:\n```\n<think>not a tag</think>\n```\ndone";
        let sections = split_xml(completion, &["think"], Some("text"));
        assert_eq!(sections.len(), 1);
        assert!(sections[0].1.contains("<think>not a tag</think>"));
    }

    #[test]
    fn tags_inside_inline_code_are_literal() {
        let completion = "escape `<think>` like this";
        let sections = split_xml(completion, &["think"], Some("text"));
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, "text");
    }

    #[test]
    fn untagged_text_is_discarded_without_default() {
        let completion = "noise <think>kept</think> more noise";
        let sections = split_xml(completion, &["think"], None);
        assert_eq!(sections, vec![("think".to_string(), "kept".to_string())]);
    }

    #[test]
    fn whitespace_between_tags_is_discarded() {
        let completion = "<think>a</think>\n\n<think>b</think>";
        let sections = split_xml(completion, &["think"], None);
        assert_eq!(sections.len(), 2);
    }
}
