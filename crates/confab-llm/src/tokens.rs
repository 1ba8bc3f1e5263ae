//! Token estimation.
//!
//! A chars/4 heuristic: close enough for budget decisions, and cheap enough
//! to run on every render. Images count a flat estimate each.

const CHARS_PER_TOKEN: usize = 4;
const IMAGE_TOKENS_ESTIMATE: u32 = 765;

pub fn estimate_tokens(text: &str, num_media: u32) -> u32 {
    let text_tokens = if text.is_empty() {
        0
    } else {
        (text.chars().count().div_ceil(CHARS_PER_TOKEN)) as u32
    };
    text_tokens + IMAGE_TOKENS_ESTIMATE * num_media
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_length() {
        assert_eq!(estimate_tokens("", 0), 0);
        assert_eq!(estimate_tokens("abcd", 0), 1);
        assert_eq!(estimate_tokens("abcde", 0), 2);
        assert_eq!(estimate_tokens("", 2), 2 * 765);
    }
}
