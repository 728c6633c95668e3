// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::error::Error;
use tower::BoxError;

/// Parse a single key-value pair
pub(crate) fn parse_key_val<T, U>(s: &str) -> Result<(T, U), BoxError>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].trim().parse()?, s[pos + 1..].trim().parse()?))
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

// Accepts a list or a comma-separated string, so that the same option can be
// set from a TOML array or from an environment variable.
pub(crate) fn deser_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) => split_list(&s),
        StringOrList::List(v) => v,
    })
}

// Regexes may contain commas, so a plain string is one pattern.
pub(crate) fn deser_pattern_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) if s.trim().is_empty() => Vec::new(),
        StringOrList::String(s) => vec![s],
        StringOrList::List(v) => v,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrMap {
    String(String),
    Map(BTreeMap<String, String>),
}

// Tags come either as a table or as "k1=v1,k2=v2".
pub(crate) fn deser_key_vals<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrMap::deserialize(deserializer)? {
        StringOrMap::Map(m) => Ok(m.into_iter().collect()),
        StringOrMap::String(s) => split_list(&s)
            .iter()
            .map(|kv| parse_key_val::<String, String>(kv).map_err(serde::de::Error::custom))
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "deser_string_list")]
        list: Vec<String>,
        #[serde(deserialize_with = "deser_key_vals")]
        tags: Vec<(String, String)>,
    }

    #[test]
    fn test_parse_key_val() {
        let (k, v) = parse_key_val::<String, String>("env = prod").unwrap();
        assert_eq!(k, "env");
        assert_eq!(v, "prod");

        assert!(parse_key_val::<String, String>("novalue").is_err());
    }

    #[test]
    fn test_list_from_string_or_array() {
        let h: Holder = serde_json::from_str(r#"{"list":"a, b,,c","tags":"k=v"}"#).unwrap();
        assert_eq!(h.list, vec!["a", "b", "c"]);
        assert_eq!(h.tags, vec![("k".to_string(), "v".to_string())]);

        let h: Holder = serde_json::from_str(r#"{"list":["x"],"tags":{"a":"1","b":"2"}}"#).unwrap();
        assert_eq!(h.list, vec!["x"]);
        assert_eq!(
            h.tags,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[derive(Deserialize)]
    struct Patterns {
        #[serde(deserialize_with = "deser_pattern_list")]
        patterns: Vec<String>,
    }

    #[test]
    fn test_pattern_list_keeps_commas() {
        let p: Patterns = serde_json::from_str(r#"{"patterns":"^\\d{1,4} "}"#).unwrap();
        assert_eq!(p.patterns, vec![r"^\d{1,4} "]);

        let p: Patterns = serde_json::from_str(r#"{"patterns":["^a","^b"]}"#).unwrap();
        assert_eq!(p.patterns, vec!["^a", "^b"]);

        let p: Patterns = serde_json::from_str(r#"{"patterns":""}"#).unwrap();
        assert!(p.patterns.is_empty());
    }

    #[test]
    fn test_bad_tag_string() {
        assert!(serde_json::from_str::<Holder>(r#"{"list":"a","tags":"oops"}"#).is_err());
    }
}
