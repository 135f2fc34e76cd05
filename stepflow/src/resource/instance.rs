//! Resource types and the exact resource instance a step asks for.

use crate::core::Version;
use crate::errors::Result;
use crate::worker::ContainerOwner;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A custom resource type made available to the build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    /// The name steps refer to it by.
    pub name: String,
    /// The underlying type providing it.
    #[serde(rename = "type")]
    pub type_: String,
    /// Configuration of the underlying resource.
    #[serde(default)]
    pub source: serde_json::Value,
    /// Whether its containers run privileged.
    #[serde(default)]
    pub privileged: bool,
    /// The pinned version of the type's image, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// The resource types in scope for a step.
pub type ResourceTypes = Vec<ResourceType>;

/// One exact (type, version, source, params) tuple.
///
/// Two instances with the same tuple are interchangeable, so the tuple is
/// what identifies a cached fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstance {
    /// Resource type.
    pub resource_type: String,
    /// Version to fetch.
    pub version: Version,
    /// Evaluated source configuration.
    pub source: serde_json::Value,
    /// Evaluated params.
    pub params: serde_json::Value,
    /// Owner of the container used for the fetch.
    pub owner: ContainerOwner,
}

impl ResourceInstance {
    /// Creates a resource instance.
    #[must_use]
    pub fn new(
        resource_type: impl Into<String>,
        version: Version,
        source: serde_json::Value,
        params: serde_json::Value,
        owner: ContainerOwner,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            version,
            source,
            params,
            owner,
        }
    }

    /// Returns a stable hex digest of the (type, version, source, params)
    /// tuple.
    ///
    /// Object keys serialize in sorted order, so logically equal
    /// configurations hash equally.
    pub fn cache_key(&self) -> Result<String> {
        let canonical = serde_json::to_vec(&serde_json::json!({
            "type": self.resource_type,
            "version": self.version,
            "source": self.source,
            "params": self.params,
        }))?;

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlanId;
    use serde_json::json;

    fn owner() -> ContainerOwner {
        ContainerOwner::new(1, PlanId::new("get"), 1)
    }

    fn version(v: &str) -> Version {
        let mut version = Version::new();
        version.insert("ref".to_string(), v.to_string());
        version
    }

    #[test]
    fn test_cache_key_is_stable() {
        let a = ResourceInstance::new("git", version("v1"), json!({"uri": "x", "branch": "main"}), json!({}), owner());
        let b = ResourceInstance::new("git", version("v1"), json!({"branch": "main", "uri": "x"}), json!({}), owner());
        assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());
        assert_eq!(a.cache_key().unwrap().len(), 64);
    }

    #[test]
    fn test_cache_key_covers_every_component() {
        let base = ResourceInstance::new("git", version("v1"), json!({"uri": "x"}), json!({}), owner());
        let key = base.cache_key().unwrap();

        let mut other = base.clone();
        other.version = version("v2");
        assert_ne!(other.cache_key().unwrap(), key);

        let mut other = base.clone();
        other.params = json!({"depth": 1});
        assert_ne!(other.cache_key().unwrap(), key);

        let mut other = base.clone();
        other.resource_type = "s3".to_string();
        assert_ne!(other.cache_key().unwrap(), key);

        let mut other = base;
        other.source = json!({"uri": "y"});
        assert_ne!(other.cache_key().unwrap(), key);
    }

    #[test]
    fn test_resource_type_deserializes() {
        let rt: ResourceType =
            serde_json::from_value(json!({"name": "slack", "type": "docker-image"})).unwrap();
        assert_eq!(rt.type_, "docker-image");
        assert!(!rt.privileged);
    }
}
