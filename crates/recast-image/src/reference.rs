//! Image reference parsing.
//!
//! A reference is `[host[:port]/]path[:tag]`. Path components are
//! lowercase alphanumerics joined by single `.`, `_`, or `-` separators;
//! tags are up to 128 characters of `[A-Za-z0-9_.-]` not starting with
//! `.` or `-`. Digest references (`@sha256:...`) are not accepted since
//! builds always produce a tagged name.

use std::fmt;

use recast_common::constants::DEFAULT_TAG;
use recast_common::error::{RecastError, Result};

const MAX_TAG_LENGTH: usize = 128;

/// A parsed `repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Repository path, including any registry host.
    pub repository: String,
    /// Tag.
    pub tag: String,
}

impl ImageRef {
    /// Parses a reference, defaulting the tag to `latest`.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceResolution` if the reference is malformed.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_with_default_tag(reference, DEFAULT_TAG)
    }

    /// Parses a reference, using `default_tag` when none is given.
    ///
    /// # Errors
    ///
    /// Returns `ReferenceResolution` if the reference or the default tag is
    /// malformed.
    pub fn parse_with_default_tag(reference: &str, default_tag: &str) -> Result<Self> {
        let fail = |reason: &str| RecastError::ReferenceResolution {
            reference: reference.to_owned(),
            reason: reason.to_owned(),
        };
        if reference.is_empty() {
            return Err(fail("empty reference"));
        }
        if reference.contains('@') {
            return Err(fail("digest references are not supported"));
        }

        let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, default_tag),
        };

        if !is_valid_tag(tag) {
            return Err(fail(&format!("invalid tag '{tag}'")));
        }
        validate_repository(repository).map_err(|reason| fail(&reason))?;

        Ok(Self {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        })
    }

    /// Renders `repository:tag`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".to_owned());
    }
    let components: Vec<&str> = repository.split('/').collect();
    for (i, component) in components.iter().enumerate() {
        let is_host = i == 0 && components.len() > 1 && looks_like_host(component);
        let valid = if is_host {
            is_valid_host(component)
        } else {
            is_valid_path_component(component)
        };
        if !valid {
            return Err(format!("invalid repository component '{component}'"));
        }
    }
    Ok(())
}

/// A first component is a registry host when it has a dot, a port, or is
/// `localhost`.
fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn is_valid_host(component: &str) -> bool {
    let (host, port) = match component.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (component, None),
    };
    let host_ok = !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    host_ok && port_ok
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= MAX_TAG_LENGTH
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_defaults_to_latest() {
        let r = ImageRef::parse("myorg/base").expect("parse");
        assert_eq!(r.repository, "myorg/base");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.full_name(), "myorg/base:latest");
    }

    #[test]
    fn explicit_tag_is_kept() {
        let r = ImageRef::parse("myorg/base:v1.2").expect("parse");
        assert_eq!(r.full_name(), "myorg/base:v1.2");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = ImageRef::parse("localhost:5000/base").expect("parse");
        assert_eq!(r.repository, "localhost:5000/base");
        assert_eq!(r.tag, "latest");
        let tagged = ImageRef::parse("registry.example.com:5000/team/app:rc1").expect("parse");
        assert_eq!(tagged.repository, "registry.example.com:5000/team/app");
        assert_eq!(tagged.tag, "rc1");
    }

    #[test]
    fn custom_default_tag() {
        let r = ImageRef::parse_with_default_tag("app", "nightly").expect("parse");
        assert_eq!(r.full_name(), "app:nightly");
    }

    #[test]
    fn explicit_tag_ignores_default_tag() {
        let r = ImageRef::parse_with_default_tag("myorg/base:v2", "custom").expect("parse");
        assert_eq!(r.repository, "myorg/base");
        assert_eq!(r.tag, "v2");
        assert_eq!(r.full_name(), "myorg/base:v2");
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in [
            "",
            "UPPER/case",
            "myorg//base",
            "myorg/base:",
            "myorg/base:-bad",
            "trailing-/x",
            "name@sha256:abc",
            "a/b:c:d",
        ] {
            let err = ImageRef::parse(bad).unwrap_err();
            assert!(
                matches!(err, RecastError::ReferenceResolution { .. }),
                "{bad} gave {err}"
            );
        }
    }

    #[test]
    fn separators_follow_component_grammar() {
        assert!(is_valid_path_component("a.b_c__d--e"));
        assert!(!is_valid_path_component("a..b"));
        assert!(!is_valid_path_component("a___b"));
        assert!(!is_valid_path_component("-a"));
    }

    #[test]
    fn overlong_tag_is_rejected() {
        let tag = "a".repeat(129);
        assert!(ImageRef::parse(&format!("app:{tag}")).is_err());
        assert!(ImageRef::parse(&format!("app:{}", "a".repeat(128))).is_ok());
    }
}
