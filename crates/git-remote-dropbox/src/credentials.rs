//! Credentials file: account name -> bearer token.
//!
//! A flat JSON object with `"default"` as the fallback key. Tokens are
//! long-lived, so they are loaded once at startup; there is no runtime
//! refresh.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dropbox_git::error::{Error, Result};

use crate::url::TokenSelector;

const DEFAULT_KEY: &str = "default";
const FILE_NAME: &str = "git-remote-dropbox.json";

pub struct Credentials {
    tokens: BTreeMap<String, String>,
    path: PathBuf,
}

impl Credentials {
    /// Candidate file locations, in priority order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                paths.push(PathBuf::from(xdg).join("git").join(FILE_NAME));
            }
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("git").join(FILE_NAME));
            paths.push(home.join(format!(".{}", FILE_NAME)));
        }
        paths
    }

    /// Load the first credentials file found, or an empty set that will be
    /// saved to the preferred location.
    pub fn load() -> Result<Self> {
        let paths = Self::search_paths();
        for path in &paths {
            if path.exists() {
                return Self::load_from(path);
            }
        }
        let path = paths
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?;
        Ok(Self {
            tokens: BTreeMap::new(),
            path,
        })
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let tokens: BTreeMap<String, String> = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid credentials file {}: {}", path.display(), e)))?;
        Ok(Self {
            tokens,
            path: path.to_path_buf(),
        })
    }

    /// The token a remote URL selects, or an error telling the user how to
    /// log in.
    pub fn token_for(&self, selector: &TokenSelector) -> Result<String> {
        match selector {
            TokenSelector::Inline(token) => Ok(token.clone()),
            TokenSelector::Named(name) => self.tokens.get(name).cloned().ok_or_else(|| {
                Error::Config(format!(
                    "you must log in first with 'git-dropbox-manage login {}'",
                    name
                ))
            }),
            TokenSelector::Default => self.tokens.get(DEFAULT_KEY).cloned().ok_or_else(|| {
                Error::Config("you must log in first with 'git-dropbox-manage login'".into())
            }),
        }
    }

    pub fn set(&mut self, name: Option<&str>, token: String) {
        self.tokens.insert(name.unwrap_or(DEFAULT_KEY).to_string(), token);
    }

    pub fn remove(&mut self, name: Option<&str>) {
        self.tokens.remove(name.unwrap_or(DEFAULT_KEY));
    }

    pub fn has_default(&self) -> bool {
        self.tokens.contains_key(DEFAULT_KEY)
    }

    /// Named accounts, excluding the default entry.
    pub fn names(&self) -> Vec<&str> {
        self.tokens
            .keys()
            .map(String::as_str)
            .filter(|name| *name != DEFAULT_KEY)
            .collect()
    }

    /// Atomic write with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Config("credentials path has no parent".into()))?;
        fs::create_dir_all(parent)?;

        let contents = serde_json::to_string_pretty(&self.tokens)
            .map_err(|e| Error::Config(format!("serialize credentials: {}", e)))?;

        // same directory as the target so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| Error::Config(format!("write credentials: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_and_selectors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(
            &path,
            r#"{"default": "TOK-D", "work": "TOK-W"}"#,
        )
        .unwrap();

        let creds = Credentials::load_from(&path).unwrap();
        assert_eq!(creds.token_for(&TokenSelector::Default).unwrap(), "TOK-D");
        assert_eq!(
            creds.token_for(&TokenSelector::Named("work".into())).unwrap(),
            "TOK-W"
        );
        assert_eq!(
            creds
                .token_for(&TokenSelector::Inline("INLINE".into()))
                .unwrap(),
            "INLINE"
        );
        assert!(creds
            .token_for(&TokenSelector::Named("nobody".into()))
            .is_err());
        assert_eq!(creds.names(), vec!["work"]);
        assert!(creds.has_default());
    }

    #[test]
    fn save_sets_restrictive_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");
        let mut creds = Credentials {
            tokens: BTreeMap::new(),
            path: path.clone(),
        };
        creds.set(None, "SECRET".into());
        creds.set(Some("work"), "OTHER".into());
        creds.save().unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = Credentials::load_from(&path).unwrap();
        assert_eq!(reloaded.token_for(&TokenSelector::Default).unwrap(), "SECRET");

        // logout removes an entry
        let mut reloaded = reloaded;
        reloaded.remove(Some("work"));
        reloaded.save().unwrap();
        let reloaded = Credentials::load_from(&path).unwrap();
        assert!(reloaded.names().is_empty());
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Credentials::load_from(&path),
            Err(Error::Config(_))
        ));
    }
}
