/*!
 * Line Tokenizer
 *
 * Shell-like splitting shared by the command bus and the lookup-table file
 * parser: whitespace-delimited words, double-quoted strings with
 * backslash-escaped quotes, and `arg{a, b}` brace groups that keep their
 * embedded whitespace.
 */

/// Hard cap on arguments produced from one line.
pub const MAX_ARGS: usize = 64;

/// Split a command or configuration line into arguments.
///
/// Rules:
/// - words are separated by unquoted whitespace;
/// - `"..."` spans whitespace, `\"` embeds a quote, the backslash is dropped;
/// - inside `{...}` whitespace does not split, so `deny{a, b}` is one token.
#[must_use]
pub fn split_args(line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() && argv.len() < MAX_ARGS {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let mut tok = String::new();
        if bytes[i] == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                    tok.push('"');
                    i += 2;
                } else {
                    tok.push(bytes[i] as char);
                    i += 1;
                }
            }
            if i < bytes.len() {
                i += 1; // closing quote
            }
        } else {
            let mut brkt = false;
            while i < bytes.len() && (!bytes[i].is_ascii_whitespace() || brkt) {
                match bytes[i] {
                    b'{' => brkt = true,
                    b'}' if brkt => brkt = false,
                    _ => {}
                }
                tok.push(bytes[i] as char);
                i += 1;
            }
        }
        argv.push(tok);
    }

    argv
}

/// Split the comma-separated body of a `{...}` group, trimming each element.
/// A token without braces is returned whole.
#[must_use]
pub fn split_bracket_list(token: &str) -> Vec<String> {
    let inner = match (token.find('{'), token.rfind('}')) {
        (Some(open), Some(close)) if open < close => &token[open + 1..close],
        _ => return vec![token.to_string()],
    };
    inner
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Strip an unquoted trailing `#` comment from a line.
#[must_use]
pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            b'#' if !in_quote => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_split() {
        assert_eq!(split_args("stop now  please"), vec!["stop", "now", "please"]);
    }

    #[test]
    fn quoted_with_escape() {
        assert_eq!(
            split_args(r#"log "a \"quoted\" path" end"#),
            vec!["log", r#"a "quoted" path"#, "end"]
        );
    }

    #[test]
    fn brace_groups_keep_whitespace() {
        assert_eq!(
            split_args("acl deny{10.0.0.1, 10.0.0.2} allow"),
            vec!["acl", "deny{10.0.0.1, 10.0.0.2}", "allow"]
        );
    }

    #[test]
    fn bracket_list_split() {
        assert_eq!(
            split_bracket_list("deny{10.0.0.1, 10.0.0.2}"),
            vec!["10.0.0.1", "10.0.0.2"]
        );
        assert_eq!(split_bracket_list("plain"), vec!["plain"]);
    }

    #[test]
    fn comments() {
        assert_eq!(strip_comment("key: v1, v2 # note"), "key: v1, v2 ");
        assert_eq!(strip_comment(r#""quoted # not comment" # real"#), r#""quoted # not comment" "#);
    }

    #[test]
    fn empty_line() {
        assert!(split_args("   ").is_empty());
    }
}
