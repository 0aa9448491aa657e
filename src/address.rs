//! Chat address normalization and identity validation.
//!
//! A federated chat address looks like `local@domain/resource`. The resource
//! suffix names one client session; everything in this daemon keys on the
//! bare form (`local@domain`), which identifies the contact.

use crate::error::Error;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// A bare chat address: `local@domain` with any resource suffix removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BareAddress(String);

impl BareAddress {
    /// Parse and normalize a raw address, stripping the resource suffix.
    ///
    /// Rejects anything that is not syntactically `local@domain` once the
    /// resource is removed.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let bare = match raw.split_once('/') {
            Some((bare, _resource)) => bare,
            None => raw,
        };

        let Some((local, domain)) = bare.split_once('@') else {
            return Err(Error::validation("address", "missing '@' separator"));
        };
        if local.is_empty() {
            return Err(Error::validation("address", "empty local part"));
        }
        if domain.is_empty() || domain.contains('@') {
            return Err(Error::validation("address", "invalid domain part"));
        }
        if bare.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::validation("address", "whitespace in address"));
        }

        // Domains are case-insensitive; fold so lookups key consistently.
        Ok(Self(format!("{}@{}", local, domain.to_ascii_lowercase())))
    }

    /// The normalized bare address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

/// Validate a username against the allowed pattern (`[A-Za-z0-9_-]+`).
pub fn validate_username(username: &str) -> Result<(), Error> {
    if username_pattern().is_match(username) {
        Ok(())
    } else {
        Err(Error::validation(
            "username",
            "may only contain letters, numbers, '_' and '-'",
        ))
    }
}
