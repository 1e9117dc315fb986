// Image references: `name[:tag]`, resolved against a configured registry
// host and organization. `latest` is the default tag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::registry::error::PullError;

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, PullError> {
        let invalid = |reason: &str| PullError::InvalidImageFormat {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name, tag) = match trimmed.split_once(':') {
            Some((name, tag)) => {
                if tag.contains(':') {
                    return Err(invalid("more than one ':'"));
                }
                (name, tag)
            }
            None => (trimmed, DEFAULT_TAG),
        };

        validate_name(name).map_err(|reason| invalid(&reason))?;
        validate_tag(tag).map_err(|reason| invalid(&reason))?;

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// `<organization>/<name>` as used in registry paths and token scopes.
    pub fn repository(&self, organization: &str) -> String {
        format!("{}/{}", organization, self.name)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = PullError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > 128 {
        return Err("name is longer than 128 characters".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    {
        return Err("name may only contain lowercase letters, digits, '.', '_' and '-'".to_string());
    }
    let first = name.chars().next().unwrap_or('.');
    let last = name.chars().last().unwrap_or('.');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err("name must start and end with a letter or digit".to_string());
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("tag is empty".to_string());
    }
    if tag.len() > 128 {
        return Err("tag is longer than 128 characters".to_string());
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err("tag must not start with '.' or '-'".to_string());
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("tag may only contain letters, digits, '.', '_' and '-'".to_string());
    }
    Ok(())
}
