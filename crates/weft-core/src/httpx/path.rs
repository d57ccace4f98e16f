//! Path patterns — route templates with named value extraction.
//!
//! A pattern is a `/`-separated template: literal segments, `{name}`
//! capturing one segment, `*` matching one segment without capturing,
//! and `{name+}` capturing the whole remaining tail (final segment
//! only). `subject_path` renders the pattern into its subject form
//! (`{name}`/`*` → `*`, `{name+}` → `>`).

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Lit(String),
    AnyOne,
    Var(String),
    Rest(String),
}

/// A parsed route template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segs: Vec<Seg>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<PathPattern> {
        let mut segs = Vec::new();
        let parts: Vec<&str> = pattern.split('/').filter(|p| !p.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            let seg = if *part == "*" {
                Seg::AnyOne
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if inner.is_empty() {
                    return Err(Error::bad_request(format!("empty capture in '{pattern}'")));
                }
                if let Some(name) = inner.strip_suffix('+') {
                    if i != parts.len() - 1 {
                        return Err(Error::bad_request(format!(
                            "greedy capture must be final in '{pattern}'"
                        )));
                    }
                    Seg::Rest(name.to_string())
                } else {
                    Seg::Var(inner.to_string())
                }
            } else if part.contains('{') || part.contains('}') {
                return Err(Error::bad_request(format!("malformed segment '{part}'")));
            } else {
                Seg::Lit(part.to_string())
            };
            segs.push(seg);
        }
        Ok(PathPattern { raw: pattern.to_string(), segs })
    }

    /// The original template text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Render into the path part of a subject: captures become
    /// wildcards.
    pub fn subject_path(&self) -> String {
        let mut out = String::new();
        for seg in &self.segs {
            out.push('/');
            match seg {
                Seg::Lit(s) => out.push_str(s),
                Seg::AnyOne | Seg::Var(_) => out.push('*'),
                Seg::Rest(_) => out.push('>'),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn matches(&self, path: &str) -> bool {
        self.extract(path).is_some()
    }

    /// Extract named values from a live path. `None` when the path does
    /// not match the template.
    pub fn extract(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let mut out = Vec::new();
        let mut pi = 0;
        for seg in &self.segs {
            match seg {
                Seg::Rest(name) => {
                    // One or more remaining segments.
                    if pi >= parts.len() {
                        return None;
                    }
                    out.push((name.clone(), parts[pi..].join("/")));
                    return Some(out);
                }
                _ if pi >= parts.len() => return None,
                Seg::Lit(s) => {
                    if parts[pi] != s {
                        return None;
                    }
                    pi += 1;
                }
                Seg::AnyOne => pi += 1,
                Seg::Var(name) => {
                    out.push((name.clone(), parts[pi].to_string()));
                    pi += 1;
                }
            }
        }
        if pi == parts.len() {
            Some(out)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        let p = PathPattern::parse("/echo/loud").unwrap();
        assert!(p.matches("/echo/loud"));
        assert!(!p.matches("/echo"));
        assert!(!p.matches("/echo/loud/er"));
        assert_eq!(p.subject_path(), "/echo/loud");
    }

    #[test]
    fn named_captures() {
        let p = PathPattern::parse("/obj/{id}/child/{sub}").unwrap();
        let vals = p.extract("/obj/42/child/leg").unwrap();
        assert_eq!(
            vals,
            vec![("id".into(), "42".into()), ("sub".into(), "leg".into())]
        );
        assert_eq!(p.subject_path(), "/obj/*/child/*");
    }

    #[test]
    fn greedy_tail() {
        let p = PathPattern::parse("/files/{path+}").unwrap();
        let vals = p.extract("/files/a/b/c.txt").unwrap();
        assert_eq!(vals, vec![("path".into(), "a/b/c.txt".into())]);
        assert!(!p.matches("/files"));
        assert_eq!(p.subject_path(), "/files/>");
    }

    #[test]
    fn star_matches_without_capture() {
        let p = PathPattern::parse("/any/*/tail").unwrap();
        assert_eq!(p.extract("/any/x/tail").unwrap(), vec![]);
        assert!(!p.matches("/any/tail"));
    }

    #[test]
    fn greedy_must_be_final() {
        assert!(PathPattern::parse("/a/{p+}/b").is_err());
        assert!(PathPattern::parse("/a/{}").is_err());
        assert!(PathPattern::parse("/a/b{c}").is_err());
    }

    #[test]
    fn root_pattern() {
        let p = PathPattern::parse("/").unwrap();
        assert!(p.matches("/"));
        assert!(!p.matches("/x"));
        assert_eq!(p.subject_path(), "/");
    }
}
