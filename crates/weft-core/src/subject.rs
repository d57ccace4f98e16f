//! Subject derivation — the dotted addresses messages travel on.
//!
//! Request subjects follow
//! `<plane>.<port>.<reversed host>.|.<METHOD>.<path segments>`, e.g.
//! `fabric.443.com.example.srv.|.GET.echo`. The `|` pins the boundary
//! between the host part and the method/path part so wildcard
//! subscriptions cannot bleed across it. Replies travel on
//! `r.<plane>.<msg-id>`.
//!
//! Two wildcards: `*` matches exactly one segment, `>` matches one or
//! more and may only terminate a subject.

use crate::error::{Error, Result};

/// Port used when a request URL does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// Build the subject a request to `METHOD https://host:port/path` travels on.
///
/// `method` may be `*` (subscription to any method). Path segments that
/// are `*` or `>` pass through as wildcards; everything else is escaped
/// to the subject-safe charset.
pub fn for_request(plane: &str, port: u16, host: &str, method: &str, path: &str) -> String {
    let mut s = String::with_capacity(plane.len() + host.len() + path.len() + 16);
    s.push_str(plane);
    s.push('.');
    s.push_str(&port.to_string());
    s.push('.');
    s.push_str(&reverse_host(host));
    s.push_str(".|.");
    if method == "*" {
        s.push('*');
    } else {
        s.push_str(&method.to_uppercase());
    }
    for seg in path.split('/').filter(|seg| !seg.is_empty()) {
        s.push('.');
        if seg == "*" || seg == ">" {
            s.push_str(seg);
        } else {
            s.push_str(&escape_segment(seg));
        }
    }
    // A bare path still owns its root: subscribe to the host root itself.
    if path.split('/').all(|seg| seg.is_empty()) {
        s.push('.');
        s.push('_');
    }
    s
}

/// Build the reply subject for a message id.
pub fn for_reply(plane: &str, msg_id: &str) -> String {
    format!("r.{plane}.{msg_id}")
}

/// Reverse the dot-separated labels of a hostname:
/// `srv.example.com` → `com.example.srv`.
pub fn reverse_host(host: &str) -> String {
    let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    labels.reverse();
    labels.join(".")
}

/// Escape a path segment into the subject-safe charset.
/// Letters and digits are lowercased; everything else becomes `_`.
pub fn escape_segment(seg: &str) -> String {
    seg.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// A hostname is one or more dot-separated labels of `[a-z0-9-]`,
/// starting with an alphanumeric.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::bad_request("empty hostname"));
    }
    for label in host.split('.') {
        let ok = !label.is_empty()
            && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && label.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        if !ok {
            return Err(Error::bad_request(format!("invalid hostname '{host}'")));
        }
    }
    Ok(())
}

/// A plane is a single lowercase alphanumeric label.
pub fn validate_plane(plane: &str) -> Result<()> {
    if plane.is_empty()
        || !plane.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(Error::bad_request(format!("invalid plane '{plane}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_subject_layout() {
        let s = for_request("fabric", 443, "srv.example.com", "GET", "/echo/loud");
        assert_eq!(s, "fabric.443.com.example.srv.|.GET.echo.loud");
    }

    #[test]
    fn root_path_gets_placeholder() {
        let s = for_request("fabric", 443, "echo", "GET", "/");
        assert_eq!(s, "fabric.443.echo.|.GET._");
    }

    #[test]
    fn wildcards_pass_through() {
        let s = for_request("fabric", 443, "echo", "*", "/obj/*/child/>");
        assert_eq!(s, "fabric.443.echo.|.*.obj.*.child.>");
    }

    #[test]
    fn segments_are_escaped() {
        let s = for_request("fabric", 443, "echo", "GET", "/My Docs/a.b");
        assert_eq!(s, "fabric.443.echo.|.GET.my_docs.a_b");
    }

    #[test]
    fn reply_subject() {
        assert_eq!(for_reply("fabric", "a1b2"), "r.fabric.a1b2");
    }

    #[test]
    fn host_validation() {
        assert!(validate_host("srv.example.com").is_ok());
        assert!(validate_host("echo").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("Has.Caps").is_err());
        assert!(validate_host("a..b").is_err());
        assert!(validate_host("-lead").is_err());
    }

    #[test]
    fn plane_validation() {
        assert!(validate_plane("fabric7").is_ok());
        assert!(validate_plane("").is_err());
        assert!(validate_plane("two.words").is_err());
    }
}
