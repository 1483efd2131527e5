use unicode_normalization::UnicodeNormalization;

/// Lowercase, strip diacritics and trim.
pub fn normalize_text(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

/// Normalized alphanumeric tokens; punctuation separates tokens.
pub fn tokens(input: &str) -> Vec<String> {
    normalize_text(input)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Letters only, ASCII folded, single spaces; input for phonetic encoders.
pub(crate) fn normalize_for_phonetic(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in normalize_text(s).chars() {
        if ch.is_ascii_alphabetic() {
            out.push(ch);
        } else if ch.is_whitespace() {
            if !out.is_empty() && !out.ends_with(' ') {
                out.push(' ');
            }
        } else {
            match ch {
                'ß' => out.push_str("ss"),
                'æ' => out.push_str("ae"),
                'ø' => out.push('o'),
                'đ' => out.push('d'),
                _ => {}
            }
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_diacritics() {
        assert_eq!(normalize_text("Álvaro"), "alvaro");
        assert_eq!(normalize_text("  José  "), "jose");
    }

    #[test]
    fn test_tokens_split_on_punctuation() {
        assert_eq!(
            tokens("ACME Corp., Inc."),
            vec!["acme".to_string(), "corp".into(), "inc".into()]
        );
        assert!(tokens("  --  ").is_empty());
    }

    #[test]
    fn test_phonetic_input() {
        assert_eq!(normalize_for_phonetic("Strauß  & Søn"), "strauss son");
    }
}
