//! Tag policies.

use chrono::Local;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::TagPolicy;
use crate::error::{DevError, Result};

const DEFAULT_DATE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Produces the fully qualified image reference to build for an artifact.
pub trait Tagger: Send + Sync {
    fn generate_fully_qualified_image_name(&self, workspace: &Path, image_name: &str)
        -> Result<String>;
}

/// `image:latest`; the build cache makes the content identity.
#[derive(Debug, Clone, Default)]
pub struct ChecksumTagger;

impl Tagger for ChecksumTagger {
    fn generate_fully_qualified_image_name(&self, _workspace: &Path, image_name: &str) -> Result<String> {
        Ok(format!("{}:latest", image_name))
    }
}

/// `image:<local time>`.
#[derive(Debug, Clone)]
pub struct DateTimeTagger {
    format: String,
}

impl DateTimeTagger {
    pub fn new(format: Option<&str>) -> Self {
        Self {
            format: format.unwrap_or(DEFAULT_DATE_TIME_FORMAT).to_string(),
        }
    }
}

impl Tagger for DateTimeTagger {
    fn generate_fully_qualified_image_name(&self, _workspace: &Path, image_name: &str) -> Result<String> {
        let mut stamp = String::new();
        // An invalid format item surfaces as a fmt error rather than a panic.
        if write!(stamp, "{}", Local::now().format(&self.format)).is_err()
            || stamp.is_empty() || stamp.contains(char::is_whitespace) {
            return Err(DevError::Tag {
                image: image_name.to_string(),
                message: format!("format {:?} does not yield a valid tag", self.format),
            });
        }
        Ok(format!("{}:{}", image_name, stamp))
    }
}

/// A fixed user-supplied tag.
#[derive(Debug, Clone)]
pub struct CustomTag {
    pub tag: String,
}

impl Tagger for CustomTag {
    fn generate_fully_qualified_image_name(&self, _workspace: &Path, image_name: &str) -> Result<String> {
        if self.tag.is_empty() {
            return Err(DevError::Tag {
                image: image_name.to_string(),
                message: "custom tag is empty".to_string(),
            });
        }
        Ok(format!("{}:{}", image_name, self.tag))
    }
}

/// Pick a tagger. A non-empty `custom_tag` overrides the configured policy.
pub fn tagger_for(policy: &TagPolicy, custom_tag: Option<&str>) -> Arc<dyn Tagger> {
    if let Some(tag) = custom_tag.filter(|t| !t.is_empty()) {
        return Arc::new(CustomTag { tag: tag.to_string() });
    }
    if let Some(custom) = &policy.custom {
        return Arc::new(CustomTag { tag: custom.tag.clone() });
    }
    if let Some(date_time) = &policy.date_time {
        return Arc::new(DateTimeTagger::new(date_time.format.as_deref()));
    }
    Arc::new(ChecksumTagger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomTagger, DateTimeTagger as DateTimeConfig};

    #[test]
    fn test_checksum_tagger() {
        let tag = ChecksumTagger
            .generate_fully_qualified_image_name(Path::new("."), "web")
            .unwrap();
        assert_eq!(tag, "web:latest");
    }

    #[test]
    fn test_date_time_tagger_format() {
        let tag = DateTimeTagger::new(Some("%Y"))
            .generate_fully_qualified_image_name(Path::new("."), "web")
            .unwrap();
        assert!(tag.starts_with("web:20"));
        assert_eq!(tag.len(), "web:".len() + 4);
    }

    #[test]
    fn test_date_time_tagger_rejects_whitespace() {
        let err = DateTimeTagger::new(Some("%Y %m"))
            .generate_fully_qualified_image_name(Path::new("."), "web")
            .unwrap_err();
        assert!(matches!(err, DevError::Tag { .. }));
    }

    #[test]
    fn test_tagger_for_precedence() {
        let policy = TagPolicy {
            sha: None,
            date_time: Some(DateTimeConfig { format: None }),
            custom: None,
        };
        let tagger = tagger_for(&policy, Some("dev"));
        assert_eq!(
            tagger.generate_fully_qualified_image_name(Path::new("."), "a").unwrap(),
            "a:dev"
        );

        let policy = TagPolicy {
            custom: Some(CustomTagger { tag: "v1".to_string() }),
            ..TagPolicy::default()
        };
        let tagger = tagger_for(&policy, None);
        assert_eq!(
            tagger.generate_fully_qualified_image_name(Path::new("."), "a").unwrap(),
            "a:v1"
        );

        let tagger = tagger_for(&TagPolicy::default(), Some(""));
        assert_eq!(
            tagger.generate_fully_qualified_image_name(Path::new("."), "a").unwrap(),
            "a:latest"
        );
    }
}
