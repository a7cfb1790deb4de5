/// Find the index of the `}` closing the outermost JSON object in `data`.
///
/// Leading ASCII whitespace is skipped; the first non-whitespace byte must
/// be `{`. Braces inside string literals are ignored, and backslash escapes
/// inside strings are honored. Returns `None` when no complete object is
/// observable in the window.
pub fn find_json_end(data: &[u8]) -> Option<usize> {
    let mut start = 0;
    while start < data.len() && matches!(data[start], b' ' | b'\t' | b'\n' | b'\r') {
        start += 1;
    }

    if start >= data.len() || data[start] != b'{' {
        return None;
    }

    let mut brace_count = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in data.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }

        if c == b'\\' {
            escaped = true;
            continue;
        }

        if c == b'"' {
            in_string = !in_string;
            continue;
        }

        if !in_string {
            if c == b'{' {
                brace_count += 1;
            } else if c == b'}' {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(i);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_object_end() {
        assert_eq!(find_json_end(b"{}"), Some(1));
        assert_eq!(find_json_end(br#"{"a":1}"#), Some(6));
    }

    #[test]
    fn skips_leading_whitespace() {
        assert_eq!(find_json_end(b"  \r\n\t{\"a\":1}"), Some(11));
    }

    #[test]
    fn handles_nested_objects() {
        let data = br#"{"a":{"b":{"c":1}},"d":2}"#;
        assert_eq!(find_json_end(data), Some(data.len() - 1));
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let data = br#"{"a":"}{}{","b":1}"#;
        assert_eq!(find_json_end(data), Some(data.len() - 1));
    }

    #[test]
    fn honors_escaped_quotes() {
        let data = br#"{"a":"he said \"}\" loudly"}"#;
        assert_eq!(find_json_end(data), Some(data.len() - 1));
    }

    #[test]
    fn ignores_trailing_garbage() {
        let data = br#"{"a":1} trailing"#;
        assert_eq!(find_json_end(data), Some(6));
    }

    #[test]
    fn rejects_incomplete_and_non_objects() {
        assert_eq!(find_json_end(b""), None);
        assert_eq!(find_json_end(b"   "), None);
        assert_eq!(find_json_end(b"[1,2,3]"), None);
        assert_eq!(find_json_end(br#"{"a":1"#), None);
        assert_eq!(find_json_end(br#"{"a":"unterminated}"#), None);
    }
}
