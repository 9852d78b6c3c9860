use std::borrow::Cow;

const JWT_PREFIX: &str = "eyJ";

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' || ch == '='
}

/// Replaces anything shaped like a compact token (`eyJ...`) with a marker.
pub fn redact_tokens(input: &str) -> Cow<'_, str> {
    if !input.contains(JWT_PREFIX) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(JWT_PREFIX) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let consumed: usize = rest
            .chars()
            .take_while(|ch| is_token_char(*ch))
            .map(char::len_utf8)
            .sum();
        out.push_str("REDACTED");
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - nee.len()).find(|&i| hay[i..i + nee.len()].eq_ignore_ascii_case(nee))
}

/// Redacts the value following `marker` up to the first byte in `stop`.
fn redact_after(text: String, marker: &str, stop: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    loop {
        let Some(idx) = find_ascii_case_insensitive(rest, marker) else {
            out.push_str(rest);
            break;
        };
        let end = idx + marker.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];

        if let Some(stripped) = rest.strip_prefix(' ') {
            out.push(' ');
            rest = stripped;
        }

        let consumed: usize = rest
            .chars()
            .take_while(|ch| !stop.contains(ch))
            .map(char::len_utf8)
            .sum();
        out.push_str("REDACTED");
        rest = &rest[consumed..];
    }
    out
}

/// Scrubs bearer headers, refresh/access JSON fields and raw tokens.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut value = redact_tokens(input).into_owned();

    value = redact_after(value, "Authorization: Bearer", &['\n', '\r']);
    value = redact_after(value, "\"refresh\":", &[',', '}', '\n']);
    value = redact_after(value, "\"access\":", &[',', '}', '\n']);

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_secrets_redacts_bearer_header_line() {
        let input = "authorization: Bearer sk-live-xyz\nOther: ok\n";
        let out = redact_secrets(input).to_string();
        assert_eq!(out, "authorization: Bearer REDACTED\nOther: ok\n");
    }

    #[test]
    fn redact_secrets_redacts_token_fields_in_json() {
        let input = r#"{"access": "abc", "refresh": "def"}"#;
        let out = redact_secrets(input).to_string();
        assert!(!out.contains("abc"));
        assert!(!out.contains("def"));
        assert!(out.contains(r#""refresh": REDACTED"#));
    }

    #[test]
    fn redact_tokens_replaces_compact_tokens() {
        let input = "error sending request for url (http://h/x?t=eyJhbGciOi.eyJleHAiOjF9.sig)";
        let out = redact_tokens(input);
        assert_eq!(out, "error sending request for url (http://h/x?t=REDACTED)");
    }

    #[test]
    fn untouched_input_is_borrowed() {
        assert!(matches!(redact_secrets("plain message"), Cow::Borrowed(_)));
    }
}
