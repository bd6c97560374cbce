//! Login data: credentials and the requested resource.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a resourcepart in bytes.
pub const MAX_RESOURCE_LENGTH: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource must not be empty")]
    Empty,

    #[error("resource is {0} bytes long, at most {MAX_RESOURCE_LENGTH} are allowed")]
    TooLong(usize),
}

/// The resourcepart of a full JID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resource(String);

impl Resource {
    pub fn new(resource: impl Into<String>) -> Result<Self, ResourceError> {
        let resource = resource.into();
        if resource.trim().is_empty() {
            return Err(ResourceError::Empty);
        }
        if resource.len() > MAX_RESOURCE_LENGTH {
            return Err(ResourceError::TooLong(resource.len()));
        }
        Ok(Self(resource))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Resource {
    type Error = ResourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Resource> for String {
    fn from(resource: Resource) -> Self {
        resource.0
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials and resource request for a login walk.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginContext {
    pub username: String,
    pub password: String,
    pub resource: Option<Resource>,
}

impl LoginContext {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            resource: None,
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for LoginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginContext")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_validation() {
        assert_eq!(Resource::new(""), Err(ResourceError::Empty));
        assert_eq!(Resource::new("   "), Err(ResourceError::Empty));
        assert_eq!(
            Resource::new("x".repeat(MAX_RESOURCE_LENGTH + 1)),
            Err(ResourceError::TooLong(MAX_RESOURCE_LENGTH + 1))
        );
        assert_eq!(Resource::new("laptop").unwrap().as_str(), "laptop");
    }

    #[test]
    fn login_debug_redacts_password() {
        let login = LoginContext::new("juliet", "secret")
            .with_resource(Resource::new("balcony").unwrap());
        let debug = format!("{login:?}");
        assert!(debug.contains("juliet"));
        assert!(debug.contains("balcony"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn resource_rejects_empty_on_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            resource: Resource,
        }

        let ok: Wrapper = toml::from_str(r#"resource = "desk""#).unwrap();
        assert_eq!(ok.resource.as_str(), "desk");

        let err = toml::from_str::<Wrapper>(r#"resource = """#);
        assert!(err.is_err());
    }
}
