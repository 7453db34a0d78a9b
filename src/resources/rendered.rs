//! Components delivered as pre-rendered manifests
//!
//! Rendering happens elsewhere; this builder only decodes the documents into
//! supported kinds. A document that fails to decode fails the whole
//! component, before anything is applied.

use serde_json::Value;

use crate::{yaml, Error, Result};

use super::{ComponentBuilder, DesiredObject, DesiredObjectSet, MeshConfig};

/// Component label used for decode errors raised outside a named component
pub const COMPONENT: &str = "rendered";

/// A named component backed by rendered manifest documents
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedComponent {
    name: String,
    documents: Vec<Value>,
}

impl RenderedComponent {
    /// Component from already parsed documents
    pub fn from_values(name: impl Into<String>, documents: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            documents,
        }
    }

    /// Component from a multi-document YAML stream; empty documents are dropped
    pub fn from_yaml(name: impl Into<String>, manifests: &str) -> Result<Self> {
        let name = name.into();
        let documents = yaml::documents(manifests)
            .map_err(|e| Error::decode(name.clone(), format!("invalid manifest stream: {e}")))?
            .into_iter()
            .filter(|doc| !doc.is_null())
            .collect();
        Ok(Self { name, documents })
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Whether one of the documents is the named object of the given kind
    pub fn provides(&self, kind: &str, name: &str) -> bool {
        self.documents.iter().any(|doc| {
            doc.get("kind").and_then(Value::as_str) == Some(kind)
                && doc.pointer("/metadata/name").and_then(Value::as_str) == Some(name)
        })
    }
}

impl ComponentBuilder for RenderedComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self, _config: &MeshConfig) -> bool {
        !self.documents.is_empty()
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let mut set = DesiredObjectSet::new(self.name.clone());
        for (index, document) in self.documents.iter().enumerate() {
            let mut object = DesiredObject::from_value(document.clone()).map_err(|e| match e {
                Error::Decode { message, kind, .. } => Error::Decode {
                    component: self.name.clone(),
                    message: format!("document {index}: {message}"),
                    kind,
                },
                other => other,
            })?;
            if object.is_namespaced() && object.namespace().is_none() {
                object.meta_mut().namespace = Some(config.namespace.clone());
            }
            set.push(object);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: istio
data:
  mesh: "{}"
---
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: istio-reader
rules: []
"#;

    #[test]
    fn test_from_yaml_skips_empty_documents() {
        let component = RenderedComponent::from_yaml("base", MANIFESTS).unwrap();
        assert_eq!(component.len(), 2);
    }

    #[test]
    fn test_namespace_filled_for_namespaced_kinds() {
        let component = RenderedComponent::from_yaml("base", MANIFESTS).unwrap();
        let set = component.build(&default_config()).unwrap();
        assert_eq!(set.component, "base");
        assert_eq!(set.objects[0].namespace(), Some(NS));
        assert_eq!(set.objects[1].namespace(), None);
    }

    #[test]
    fn test_explicit_namespace_kept() {
        let component = RenderedComponent::from_values(
            "base",
            vec![serde_json::json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": { "name": "reader", "namespace": "other" }
            })],
        );
        let set = component.build(&default_config()).unwrap();
        assert_eq!(set.objects[0].namespace(), Some("other"));
    }

    /// Story: one bad document fails the component and names its position
    #[test]
    fn story_decode_failure_is_fatal_to_component() {
        let component = RenderedComponent::from_values(
            "addons",
            vec![
                serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "ok" } }),
                serde_json::json!({ "apiVersion": "batch/v1", "kind": "Job", "metadata": { "name": "bad" } }),
            ],
        );
        match component.build(&default_config()).unwrap_err() {
            Error::Decode {
                component,
                message,
                kind,
            } => {
                assert_eq!(component, "addons");
                assert!(message.starts_with("document 1:"));
                assert_eq!(kind.as_deref(), Some("Job"));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_component_is_disabled() {
        let component = RenderedComponent::from_values("empty", vec![]);
        assert!(!component.enabled(&default_config()));
        assert!(component.is_empty());
    }

    #[test]
    fn test_invalid_stream_is_decode_error() {
        let err = RenderedComponent::from_yaml("base", "a: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
