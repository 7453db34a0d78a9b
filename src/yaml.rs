//! Multi-document YAML to JSON conversion for rendered manifests

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

/// Parse a multi-document YAML stream into JSON values, one per document
///
/// Empty documents (a bare `---` or a comment-only chunk) come back as
/// `Value::Null`; callers decide whether to skip them.
pub fn documents(input: &str) -> Result<Vec<Value>, String> {
    YamlLoader::load_from_str(input)
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(to_json)
        .collect()
}

fn key_string(key: Yaml) -> Result<String, String> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        other => Err(format!("unsupported mapping key {other:?}")),
    }
}

fn to_json(yaml: Yaml) -> Result<Value, String> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(s) => {
            let f: f64 = s.parse().map_err(|e| format!("invalid float {s}: {e}"))?;
            Number::from_f64(f).map_or(Value::Null, Value::Number)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Yaml::Hash(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((key_string(k)?, to_json(v)?)))
                .collect::<Result<Map<String, Value>, String>>()?,
        ),
        Yaml::Alias(_) => return Err("aliases are not supported".to_string()),
        Yaml::BadValue => return Err("malformed value".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_document_stream() {
        let docs = documents(
            "kind: ConfigMap\nmetadata:\n  name: a\n---\nkind: Service\nspec:\n  ports:\n  - port: 80\n",
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["metadata"]["name"], "a");
        assert_eq!(docs[1]["spec"]["ports"][0]["port"], 80);
    }

    #[test]
    fn test_scalars_keep_their_types() {
        let docs = documents("a: true\nb: 1.5\nc: \"01\"\nd: ~\n").unwrap();
        assert_eq!(docs[0]["a"], true);
        assert_eq!(docs[0]["b"], 1.5);
        assert_eq!(docs[0]["c"], "01");
        assert!(docs[0]["d"].is_null());
    }

    #[test]
    fn test_syntax_error_is_reported() {
        assert!(documents("a: [unclosed").is_err());
    }
}
