//! `diff --git` / `diff --cc` header lines and git's quoted path syntax.

use super::ParseError;

/// What the first line of a file block says about the paths involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffHeader {
    /// Two-way diff. `paths` is `None` when a path containing spaces makes the
    /// `a/… b/…` split ambiguous; `rename` lines must resolve it.
    Git { paths: Option<(String, String)> },
    /// Combined diff of a merge (`diff --cc` or `diff --combined`).
    Combined { path: String },
}

impl DiffHeader {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            return Ok(DiffHeader::Git {
                paths: split_git_paths(rest)?,
            });
        }

        let rest = line
            .strip_prefix("diff --cc ")
            .or_else(|| line.strip_prefix("diff --combined "))
            .ok_or_else(|| ParseError::MalformedHeader {
                line: line.to_string(),
            })?;

        if rest.is_empty() {
            return Err(ParseError::MalformedHeader {
                line: line.to_string(),
            });
        }

        Ok(DiffHeader::Combined {
            path: unquote(rest)?,
        })
    }
}

/// Split `a/X b/Y` into `(X, Y)`.
fn split_git_paths(rest: &str) -> Result<Option<(String, String)>, ParseError> {
    if rest.starts_with('"') {
        let (before, tail) = take_quoted(rest)?;
        let tail = tail.strip_prefix(' ').ok_or_else(|| ParseError::MalformedHeader {
            line: format!("diff --git {rest}"),
        })?;
        let after = unquote(tail)?;
        return Ok(Some((strip_side(&before, "a/")?, strip_side(&after, "b/")?)));
    }

    let Some(body) = rest.strip_prefix("a/") else {
        return Err(ParseError::MalformedHeader {
            line: format!("diff --git {rest}"),
        });
    };

    if let Some(quote) = body.find(" \"b/") {
        let after = unquote(&body[quote + 1..])?;
        return Ok(Some((body[..quote].to_string(), strip_side(&after, "b/")?)));
    }

    let splits: Vec<usize> = body.match_indices(" b/").map(|(i, _)| i).collect();

    // Unchanged paths with spaces still split symmetrically.
    for &i in &splits {
        let (before, after) = (&body[..i], &body[i + 3..]);
        if before == after {
            return Ok(Some((before.to_string(), after.to_string())));
        }
    }

    match splits.as_slice() {
        [i] => Ok(Some((body[..*i].to_string(), body[*i + 3..].to_string()))),
        _ => Ok(None),
    }
}

fn strip_side(path: &str, prefix: &str) -> Result<String, ParseError> {
    path.strip_prefix(prefix)
        .map(str::to_string)
        .ok_or_else(|| ParseError::MalformedHeader {
            line: path.to_string(),
        })
}

/// Undo git's C-style quoting. Unquoted input is returned as-is.
pub fn unquote(text: &str) -> Result<String, ParseError> {
    if !text.starts_with('"') {
        return Ok(text.to_string());
    }
    let (path, rest) = take_quoted(text)?;
    if !rest.is_empty() {
        return Err(ParseError::MalformedPath {
            path: text.to_string(),
        });
    }
    Ok(path)
}

/// Read one quoted string from the front of `text`, returning it and the rest.
fn take_quoted(text: &str) -> Result<(String, &str), ParseError> {
    let malformed = || ParseError::MalformedPath {
        path: text.to_string(),
    };

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 1;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let path = String::from_utf8_lossy(&out).into_owned();
                return Ok((path, &text[i + 1..]));
            }
            b'\\' => {
                let escape = *bytes.get(i + 1).ok_or_else(malformed)?;
                i += 2;
                match escape {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'v' => out.push(0x0b),
                    b'"' | b'\\' => out.push(escape),
                    b'0'..=b'3' => {
                        let digits = bytes.get(i..i + 2).ok_or_else(malformed)?;
                        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                            return Err(malformed());
                        }
                        out.push((escape - b'0') * 64 + (digits[0] - b'0') * 8 + (digits[1] - b'0'));
                        i += 2;
                    }
                    _ => return Err(malformed()),
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    Err(malformed())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn git_paths(line: &str) -> Option<(String, String)> {
        match DiffHeader::parse(line).unwrap() {
            DiffHeader::Git { paths } => paths,
            DiffHeader::Combined { .. } => None,
        }
    }

    #[test]
    fn plain_header() {
        assert_eq!(
            git_paths("diff --git a/src/main.go b/src/main.go"),
            Some(("src/main.go".to_string(), "src/main.go".to_string()))
        );
    }

    #[test]
    fn rename_header() {
        assert_eq!(
            git_paths("diff --git a/old.txt b/new.txt"),
            Some(("old.txt".to_string(), "new.txt".to_string()))
        );
    }

    #[test]
    fn unchanged_path_with_spaces() {
        assert_eq!(
            git_paths("diff --git a/my dir b/file b/my dir b/file"),
            Some(("my dir b/file".to_string(), "my dir b/file".to_string()))
        );
    }

    #[test]
    fn renamed_path_with_spaces_is_ambiguous() {
        assert_eq!(git_paths("diff --git a/x b/y b/x b/z"), None);
    }

    #[test]
    fn quoted_paths() {
        assert_eq!(
            git_paths(r#"diff --git "a/tab\there" "b/tab\there""#),
            Some(("tab\there".to_string(), "tab\there".to_string()))
        );
    }

    #[test]
    fn octal_escapes_decode_to_utf8() {
        assert_eq!(unquote(r#""caf\303\251.txt""#).unwrap(), "café.txt");
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(matches!(
            unquote(r#""a/open"#),
            Err(ParseError::MalformedPath { .. })
        ));
    }

    #[test]
    fn combined_header() {
        assert_eq!(
            DiffHeader::parse("diff --cc lib/util.rs").unwrap(),
            DiffHeader::Combined {
                path: "lib/util.rs".to_string()
            }
        );
        assert_eq!(
            DiffHeader::parse("diff --combined README").unwrap(),
            DiffHeader::Combined {
                path: "README".to_string()
            }
        );
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert!(matches!(
            DiffHeader::parse("index 1234..5678"),
            Err(ParseError::MalformedHeader { .. })
        ));
        assert!(matches!(
            DiffHeader::parse("diff --git x y"),
            Err(ParseError::MalformedHeader { .. })
        ));
    }
}
