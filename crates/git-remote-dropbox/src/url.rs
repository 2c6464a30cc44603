//! Remote URL parsing.
//!
//! Accepted forms:
//!   dropbox:///path/to/repo
//!   dropbox://username@/path/to/repo
//!   dropbox://:token@/path/to/repo
//!
//! The path is lower-cased because Dropbox paths are case-insensitive; two
//! spellings of the same folder must map to the same repository.

use dropbox_git::error::{Error, Result};

/// Which credential the helper should use for this remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSelector {
    /// The `default` entry of the credentials file.
    Default,
    /// A named entry of the credentials file.
    Named(String),
    /// A token carried inline in the URL.
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub selector: TokenSelector,
    /// Absolute POSIX path of the repository root, no trailing slash.
    pub root: String,
}

pub fn parse_remote_url(url: &str) -> Result<RemoteUrl> {
    let rest = url
        .strip_prefix("dropbox://")
        .ok_or_else(|| Error::Config("URL must start with the \"dropbox://\" scheme".into()))?;

    let (netloc, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };

    let selector = if netloc.is_empty() {
        TokenSelector::Default
    } else {
        let userinfo = netloc.strip_suffix('@').ok_or_else(|| {
            // probably "dropbox://path/to/repo", missing the third "/"
            Error::Config("URL with no username or token must start with \"dropbox:///\"".into())
        })?;
        if let Some(token) = userinfo.strip_prefix(':') {
            if token.is_empty() {
                return Err(Error::Config("URL has an empty token".into()));
            }
            if token.contains(':') {
                return Err(Error::Config(
                    "URL must not specify both username and token".into(),
                ));
            }
            TokenSelector::Inline(token.to_string())
        } else if userinfo.contains(':') {
            return Err(Error::Config(
                "URL must not specify both username and token".into(),
            ));
        } else if userinfo.is_empty() {
            return Err(Error::Config(
                "URL with no username or token must start with \"dropbox:///\"".into(),
            ));
        } else {
            TokenSelector::Named(userinfo.to_string())
        }
    };

    if path.is_empty() || path == "/" {
        return Err(Error::Config("URL path must not be empty".into()));
    }
    if path.ends_with('/') {
        return Err(Error::Config("URL path must not have trailing slash".into()));
    }

    Ok(RemoteUrl {
        selector,
        root: path.to_lowercase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token() {
        let parsed = parse_remote_url("dropbox:///foo/bar").unwrap();
        assert_eq!(parsed.selector, TokenSelector::Default);
        assert_eq!(parsed.root, "/foo/bar");
    }

    #[test]
    fn named_user() {
        let parsed = parse_remote_url("dropbox://work@/foo").unwrap();
        assert_eq!(parsed.selector, TokenSelector::Named("work".into()));
        assert_eq!(parsed.root, "/foo");
    }

    #[test]
    fn inline_token() {
        let parsed = parse_remote_url("dropbox://:SECRET@/foo").unwrap();
        assert_eq!(parsed.selector, TokenSelector::Inline("SECRET".into()));
    }

    #[test]
    fn path_is_canonicalized() {
        let parsed = parse_remote_url("dropbox:///Foo/BAR").unwrap();
        assert_eq!(parsed.root, "/foo/bar");
    }

    #[test]
    fn rejections() {
        // wrong scheme
        assert!(parse_remote_url("https://example.com/foo").is_err());
        // missing third slash
        assert!(parse_remote_url("dropbox://path/to/repo").is_err());
        // both username and token
        assert!(parse_remote_url("dropbox://user:token@/foo").is_err());
        // empty userinfo
        assert!(parse_remote_url("dropbox://@/foo").is_err());
        // trailing slash
        assert!(parse_remote_url("dropbox:///foo/").is_err());
        // no path
        assert!(parse_remote_url("dropbox://").is_err());
        assert!(parse_remote_url("dropbox:///").is_err());
    }
}
