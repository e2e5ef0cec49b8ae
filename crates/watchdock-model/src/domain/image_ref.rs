use std::fmt;

use crate::ValidationError;

/// Repository and tag of an image, as a pull request needs them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Split `repo[:tag]`; the tag defaults to `latest`.
    ///
    /// Only a colon after the last `/` separates a tag, so registry ports
    /// (`registry:5000/app`) stay part of the repository.
    pub fn parse(image: &str) -> Result<Self, ValidationError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        let base = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match image[base..].rfind(':') {
            Some(i) => (&image[..base + i], &image[base + i + 1..]),
            None => (image, Self::DEFAULT_TAG),
        };
        if repository.is_empty() || tag.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "Image",
                value: image.to_string(),
            });
        }
        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Pull status of one image name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImagePullState {
    #[default]
    Idle,
    Pulling,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_defaults_to_latest() {
        let r = ImageRef::parse("brimstone/consul").unwrap();
        assert_eq!(r.repository, "brimstone/consul");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "brimstone/consul:latest");
    }

    #[test]
    fn explicit_tag_is_split() {
        let r = ImageRef::parse("acme/api:1.0").unwrap();
        assert_eq!(r.repository, "acme/api");
        assert_eq!(r.tag, "1.0");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = ImageRef::parse("registry.local:5000/acme/base").unwrap();
        assert_eq!(r.repository, "registry.local:5000/acme/base");
        assert_eq!(r.tag, "latest");

        let r = ImageRef::parse("registry.local:5000/acme/base:7").unwrap();
        assert_eq!(r.repository, "registry.local:5000/acme/base");
        assert_eq!(r.tag, "7");
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(ImageRef::parse("  "), Err(ValidationError::EmptyImage));
        assert!(ImageRef::parse("acme/api:").is_err());
    }
}
