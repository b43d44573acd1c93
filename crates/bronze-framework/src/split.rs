//! Text helpers used by command matching.

/// Shell-like argument splitting.
///
/// Whitespace separates arguments; single and double quotes group words;
/// inside double quotes a backslash escapes the next character. An
/// unterminated quote runs to the end of the input.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_double => escaped = true,
            '\'' if !in_double => {
                in_single = !in_single;
                quoted = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                quoted = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() || quoted {
        args.push(current);
    }

    args
}

/// Strips `prefix` from the start of `text`, comparing case-insensitively.
///
/// Works per character so multi-byte text never splits inside a code point.
pub fn strip_prefix_ignore_case<'t>(text: &'t str, prefix: &str) -> Option<&'t str> {
    let mut chars = text.char_indices();
    let mut end = 0;

    for p in prefix.chars() {
        let (i, c) = chars.next()?;
        if !chars_eq_ignore_case(c, p) {
            return None;
        }
        end = i + c.len_utf8();
    }

    Some(&text[end..])
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_split_simple() {
        assert_eq!(shell_split("hello  world"), vec!["hello", "world"]);
    }

    #[test]
    fn test_shell_split_quotes() {
        assert_eq!(
            shell_split(r#"say "hello world" 'it''s'"#),
            vec!["say", "hello world", "its"]
        );
        assert_eq!(shell_split(r#""a \"b\"""#), vec![r#"a "b""#]);
    }

    #[test]
    fn test_shell_split_empty_quoted_argument() {
        assert_eq!(shell_split(r#"set name """#), vec!["set", "name", ""]);
    }

    #[test]
    fn test_shell_split_blank() {
        assert!(shell_split("").is_empty());
        assert!(shell_split(" \t\n ").is_empty());
    }

    #[test]
    fn test_strip_prefix_ignore_case() {
        assert_eq!(strip_prefix_ignore_case("/Weather Paris", "/weather"), Some(" Paris"));
        assert_eq!(strip_prefix_ignore_case("/abc d", "/ab"), Some("c d"));
        assert_eq!(strip_prefix_ignore_case("/a", "/ab"), None);
        assert_eq!(strip_prefix_ignore_case("签到 今天", "签到"), Some(" 今天"));
        assert_eq!(strip_prefix_ignore_case("ÉTÉ", "été"), Some(""));
    }
}
