use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Attributes;

static ATTR_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap());

/// Try to read `segment` as a whitespace separated list of `key=value` pairs.
/// Returns `None` if any part of the segment does not have that shape, or if it is empty.
pub(crate) fn parse_attributes(segment: &str) -> Option<Attributes> {
    let pairs = tokenize(segment)?;
    if pairs.is_empty() {
        return None;
    }
    let mut attrs = Attributes::default();
    for (key, value) in pairs {
        attrs.set(key, value);
    }
    Some(attrs)
}

fn tokenize(segment: &str) -> Option<Vec<(&str, String)>> {
    let mut pairs = Vec::new();
    let mut rest = segment.trim_start();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        if !ATTR_KEY.is_match(key) {
            return None;
        }
        let (value, after_value) = read_value(after_key)?;
        pairs.push((key, value));
        rest = after_value.trim_start();
    }
    Some(pairs)
}

/// Read a single value, returning it together with the remaining input.
/// The value must be followed by whitespace or the end of the input.
fn read_value(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, '\'')) => {
            let end = input[1..].find('\'')? + 1;
            let rest = &input[end + 1..];
            ends_token(rest).then(|| (input[1..end].to_string(), rest))
        }
        Some((_, '"')) => {
            let mut value = String::new();
            let mut escaped = false;
            for (idx, c) in chars {
                match c {
                    _ if escaped => {
                        if c != '"' && c != '\\' {
                            value.push('\\');
                        }
                        value.push(c);
                        escaped = false;
                    }
                    '\\' => escaped = true,
                    '"' => {
                        let rest = &input[idx + 1..];
                        return ends_token(rest).then_some((value, rest));
                    }
                    _ => value.push(c),
                }
            }
            None
        }
        _ => {
            let end = input.find(char::is_whitespace).unwrap_or(input.len());
            Some((input[..end].to_string(), &input[end..]))
        }
    }
}

fn ends_token(rest: &str) -> bool {
    rest.chars().next().map_or(true, char::is_whitespace)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_pairs() {
        let attrs = parse_attributes("color=green refresh=true").unwrap();
        assert_eq!(Some("green".to_string()), attrs.color);
        assert_eq!(Some(true), attrs.refresh);
    }

    #[test]
    fn test_single_quoted_value_with_pipe() {
        let attrs = parse_attributes(r#"bash='echo "1.2.3.4" | pbcopy' terminal=false"#).unwrap();
        assert_eq!(Some(r#"echo "1.2.3.4" | pbcopy"#.to_string()), attrs.bash);
        assert_eq!(Some(false), attrs.terminal);
    }

    #[test]
    fn test_double_quoted_value_with_escapes() {
        let attrs = parse_attributes(r#"bash="say \"hi\" \n" param1=x"#).unwrap();
        assert_eq!(Some(r#"say "hi" \n"#.to_string()), attrs.bash);
        assert_eq!(vec!["x"], attrs.params());
    }

    #[test]
    fn test_values_may_contain_equals() {
        let attrs = parse_attributes("href=https://example.com/?a=b&c=d").unwrap();
        assert_eq!(Some("https://example.com/?a=b&c=d".to_string()), attrs.href);
    }

    #[test]
    fn test_empty_value() {
        let attrs = parse_attributes("color=").unwrap();
        assert_eq!(Some(String::new()), attrs.color);
    }

    #[test]
    fn test_rejects_malformed_segments() {
        assert_eq!(None, parse_attributes(""));
        assert_eq!(None, parse_attributes("   "));
        assert_eq!(None, parse_attributes("Pending: 2"));
        assert_eq!(None, parse_attributes("color=red oops"));
        assert_eq!(None, parse_attributes("bash='unterminated"));
        assert_eq!(None, parse_attributes("bash='a'b"));
        assert_eq!(None, parse_attributes("=value"));
        assert_eq!(None, parse_attributes("two words=value"));
    }
}
