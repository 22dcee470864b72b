//! Variable references in command arguments.
//!
//! Both `$NAME` and `${NAME}` are recognised. A name starts with a letter or
//! underscore and continues with letters, digits or underscores. A `$` that
//! does not start a name is copied through unchanged.

use crate::error::EnvError;

/// Expands every reference in `arg` using `lookup`.
///
/// Fails with [`EnvError::Expansion`] on the first reference `lookup` cannot
/// resolve.
pub fn expand<'a, F>(arg: &str, lookup: F) -> Result<String, EnvError>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_name(&braced[..end]) => (&braced[..end], end + 2),
                _ => ("", 0),
            }
        } else {
            let end = name_len(after);
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }

        let value = lookup(name).ok_or_else(|| EnvError::Expansion(name.to_string()))?;
        out.push_str(value);
        rest = &after[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

fn name_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(*c == '_' || c.is_ascii_alphanumeric()))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && name_len(s) == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("HOST", "db.internal"), ("PORT", "5432"), ("_X1", "x")])
    }

    fn run(arg: &str) -> Result<String, EnvError> {
        let vars = vars();
        expand(arg, |k| vars.get(k).copied())
    }

    #[test]
    fn test_plain_argument_unchanged() {
        assert_eq!(run("--verbose").unwrap(), "--verbose");
    }

    #[test]
    fn test_bare_reference() {
        assert_eq!(run("$HOST").unwrap(), "db.internal");
        assert_eq!(run("-h$HOST:$PORT").unwrap(), "-hdb.internal:5432");
    }

    #[test]
    fn test_braced_reference() {
        assert_eq!(run("${HOST}x").unwrap(), "db.internalx");
        assert_eq!(run("${_X1}${PORT}").unwrap(), "x5432");
    }

    #[test]
    fn test_undefined_reference_fails() {
        let err = run("--password=$SECRET").unwrap_err();
        assert!(matches!(err, EnvError::Expansion(ref k) if k == "SECRET"));
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        assert_eq!(run("cost: 5$").unwrap(), "cost: 5$");
        assert_eq!(run("$1").unwrap(), "$1");
        assert_eq!(run("${}").unwrap(), "${}");
        assert_eq!(run("${HOST").unwrap(), "${HOST");
    }

    #[test]
    fn test_name_stops_at_punctuation() {
        assert_eq!(run("$PORT/tcp").unwrap(), "5432/tcp");
    }
}
