//! Source references accepted by the build trigger.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SourceRef {
    /// Git: git://github.com/org/repo.git#ref, or https://…/repo.git#ref
    Git { url: String, reference: String },
    /// Local checkout: file:///srv/app or ./relative/path
    Local { path: String },
    /// Prebuilt image, used as-is: image:registry/app:tag or oci://registry/app:tag
    Image { reference: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("empty source reference")]
    Empty,
    #[error("unsupported source reference: {0}")]
    Unsupported(String),
}

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SourceError::Empty);
        }

        if let Some(reference) = raw.strip_prefix("image:") {
            Ok(SourceRef::Image { reference: reference.to_string() })
        } else if let Some(reference) = raw.strip_prefix("oci://") {
            Ok(SourceRef::Image { reference: reference.to_string() })
        } else if raw.starts_with("git://") || raw.ends_with(".git") || raw.contains(".git#") {
            let (url, reference) = raw.rsplit_once('#').unwrap_or((raw, "main"));
            Ok(SourceRef::Git {
                url: url.to_string(),
                reference: reference.to_string(),
            })
        } else if let Some(path) = raw.strip_prefix("file://") {
            Ok(SourceRef::Local { path: path.to_string() })
        } else if raw.starts_with("./") || raw.starts_with('/') || raw == "." {
            Ok(SourceRef::Local { path: raw.to_string() })
        } else {
            Err(SourceError::Unsupported(raw.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SourceRef::Git { .. } => "git",
            SourceRef::Local { .. } => "local",
            SourceRef::Image { .. } => "image",
        }
    }

    /// Environment handed to the build command describing this source.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![("SHIPWAY_SOURCE_SCHEME", self.scheme().to_string())];
        match self {
            SourceRef::Git { url, reference } => {
                env.push(("SHIPWAY_GIT_URL", url.clone()));
                env.push(("SHIPWAY_GIT_REF", reference.clone()));
            }
            SourceRef::Local { path } => env.push(("SHIPWAY_SOURCE_PATH", path.clone())),
            SourceRef::Image { reference } => env.push(("SHIPWAY_IMAGE", reference.clone())),
        }
        env
    }
}
