//! Stream features advertised by the server after each stream open.

use serde::{Deserialize, Serialize};

use crate::element::ElementName;

/// A single advertised stream feature, e.g. SASL mechanisms or the
/// compression methods offered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFeature {
    pub name: ElementName,
    /// Feature-specific values, e.g. mechanism or method names.
    #[serde(default)]
    pub values: Vec<String>,
}

impl StreamFeature {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: ElementName::new(name, namespace),
            values: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.values.push(value.into());
        self
    }

    #[must_use]
    pub fn has_value(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// The full set of features from one `<stream:features/>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFeatures {
    #[serde(default)]
    features: Vec<StreamFeature>,
}

impl StreamFeatures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature, replacing any feature with the same qualified name.
    #[must_use]
    pub fn with(mut self, feature: StreamFeature) -> Self {
        self.insert(feature);
        self
    }

    pub fn insert(&mut self, feature: StreamFeature) {
        if let Some(existing) = self.features.iter_mut().find(|f| f.name == feature.name) {
            *existing = feature;
        } else {
            self.features.push(feature);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str, namespace: &str) -> Option<&StreamFeature> {
        self.features
            .iter()
            .find(|f| f.name.name == name && f.name.namespace == namespace)
    }

    #[must_use]
    pub fn has(&self, name: &str, namespace: &str) -> bool {
        self.get(name, namespace).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamFeature> {
        self.features.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

    #[test]
    fn lookup_by_qualified_name() {
        let features = StreamFeatures::new()
            .with(StreamFeature::new("mechanisms", SASL_NS).with_value("PLAIN"))
            .with(StreamFeature::new("bind", "urn:ietf:params:xml:ns:xmpp-bind"));

        assert_eq!(features.len(), 2);
        let mechanisms = features.get("mechanisms", SASL_NS).unwrap();
        assert!(mechanisms.has_value("PLAIN"));
        assert!(!mechanisms.has_value("SCRAM-SHA-1"));
        assert!(!features.has("mechanisms", "urn:other"));
    }

    #[test]
    fn insert_replaces_same_name() {
        let mut features =
            StreamFeatures::new().with(StreamFeature::new("mechanisms", SASL_NS).with_value("PLAIN"));
        features.insert(StreamFeature::new("mechanisms", SASL_NS).with_value("SCRAM-SHA-1"));

        assert_eq!(features.len(), 1);
        let mechanisms = features.get("mechanisms", SASL_NS).unwrap();
        assert_eq!(mechanisms.values, vec!["SCRAM-SHA-1".to_owned()]);
    }

    #[test]
    fn features_from_toml() {
        let toml_str = r#"
[[features]]
values = ["zlib"]
[features.name]
name = "compression"
namespace = "http://jabber.org/features/compress"
"#;
        let features: StreamFeatures = toml::from_str(toml_str).unwrap();
        let compression = features
            .get("compression", "http://jabber.org/features/compress")
            .unwrap();
        assert!(compression.has_value("zlib"));
    }
}
