use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

/// Semantic type of a Livestatus column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Int,
    Float,
    /// Unix timestamp. Stored as an integer; fractional timestamps from
    /// Icinga2 backends are truncated.
    Time,
    StringList,
    IntList,
    Hashmap,
    CustomVariables,
    ServiceList,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int | DataType::Float | DataType::Time)
    }

    /// Decode a JSON cell received from a backend into a typed value.
    /// Backends occasionally send null for columns they know but have no
    /// data for; that maps to the type's zero value.
    pub fn value_from_json(&self, raw: &serde_json::Value) -> Value {
        use serde_json::Value as J;
        match self {
            DataType::String => match raw {
                J::String(s) => Value::Str(s.clone()),
                J::Number(n) => Value::Str(n.to_string()),
                _ => Value::Str(String::new()),
            },
            DataType::Int | DataType::Time => match raw {
                J::Number(n) => Value::Int(
                    n.as_i64()
                        .or_else(|| n.as_f64().map(|f| f as i64))
                        .unwrap_or(0),
                ),
                J::Bool(b) => Value::Int(*b as i64),
                J::String(s) => Value::Int(s.parse().unwrap_or(0)),
                _ => Value::Int(0),
            },
            DataType::Float => match raw {
                J::Number(n) => Value::Float(n.as_f64().unwrap_or(0.0)),
                J::String(s) => Value::Float(s.parse().unwrap_or(0.0)),
                _ => Value::Float(0.0),
            },
            DataType::StringList => match raw {
                J::Array(items) => Value::StrList(
                    items
                        .iter()
                        .map(|v| match v {
                            J::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                ),
                _ => Value::StrList(Vec::new()),
            },
            DataType::IntList => match raw {
                J::Array(items) => {
                    Value::IntList(items.iter().filter_map(|v| v.as_i64()).collect())
                }
                _ => Value::IntList(Vec::new()),
            },
            DataType::Hashmap | DataType::CustomVariables => match raw {
                J::Object(map) => Value::Hash(
                    map.iter()
                        .map(|(k, v)| {
                            let v = match v {
                                J::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), v)
                        })
                        .collect(),
                ),
                // Some cores send custom variables as [[name, value], ...]
                J::Array(items) => Value::Hash(
                    items
                        .iter()
                        .filter_map(|pair| {
                            let pair = pair.as_array()?;
                            Some((
                                pair.first()?.as_str()?.to_string(),
                                pair.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
                            ))
                        })
                        .collect(),
                ),
                _ => Value::Hash(BTreeMap::new()),
            },
            DataType::ServiceList => match raw {
                J::Array(items) => Value::ServiceList(
                    items
                        .iter()
                        .map(|v| match v {
                            J::String(s) => ServiceRef {
                                description: s.clone(),
                                state: 0,
                                has_been_checked: 0,
                            },
                            J::Array(parts) => ServiceRef {
                                description: parts
                                    .first()
                                    .and_then(|p| p.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                state: parts.get(1).and_then(|p| p.as_i64()).unwrap_or(0),
                                has_been_checked: parts
                                    .get(2)
                                    .and_then(|p| p.as_i64())
                                    .unwrap_or(0),
                            },
                            other => ServiceRef {
                                description: other.to_string(),
                                state: 0,
                                has_been_checked: 0,
                            },
                        })
                        .collect(),
                ),
                _ => Value::ServiceList(Vec::new()),
            },
        }
    }

    /// The value served for a column the peer never sent.
    pub fn empty_value(&self) -> Value {
        match self {
            DataType::String => Value::Str(String::new()),
            DataType::Int | DataType::Time => Value::Int(0),
            DataType::Float => Value::Float(0.0),
            DataType::StringList => Value::StrList(Vec::new()),
            DataType::IntList => Value::IntList(Vec::new()),
            DataType::Hashmap | DataType::CustomVariables => Value::Hash(BTreeMap::new()),
            DataType::ServiceList => Value::ServiceList(Vec::new()),
        }
    }
}

/// One service as referenced from a host row (description, state, checked).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRef {
    pub description: String,
    pub state: i64,
    pub has_been_checked: i64,
}

/// A single table cell. Rows are heterogeneous, so every cell carries its
/// variant tag; filter and sort dispatch on it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Str(String),
    Int(i64),
    Float(f64),
    StrList(Vec<String>),
    IntList(Vec<i64>),
    Hash(BTreeMap<String, String>),
    ServiceList(Vec<ServiceRef>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Render the way csv output and string comparisons see it.
    pub fn to_wire_string(&self) -> String {
        match self {
            Value::Nil => String::new(),
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::StrList(l) => l.join(","),
            Value::IntList(l) => l
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Value::Hash(m) => m
                .iter()
                .map(|(k, v)| format!("{k}|{v}"))
                .collect::<Vec<_>>()
                .join(","),
            Value::ServiceList(l) => l
                .iter()
                .map(|s| format!("{}|{}|{}", s.description, s.state, s.has_been_checked))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value as J};
        match self {
            Value::Nil => J::Null,
            Value::Str(s) => json!(s),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::StrList(l) => json!(l),
            Value::IntList(l) => json!(l),
            Value::Hash(m) => json!(m),
            Value::ServiceList(l) => J::Array(
                l.iter()
                    .map(|s| json!([s.description, s.state, s.has_been_checked]))
                    .collect(),
            ),
        }
    }

    /// Ordering used by Sort and by the relational filter operators.
    /// Numeric when both sides are numbers, lexicographic otherwise.
    pub fn cmp_values(&self, other: &Value) -> Ordering {
        match (self.as_float(), other.as_float()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => self.to_wire_string().cmp(&other.to_wire_string()),
        }
    }
}

// Trailing zeros trimmed so ints-in-float-columns round trip as ints,
// matching what monitoring cores emit.
fn format_float(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_decoding_by_type() {
        let v = DataType::Int.value_from_json(&serde_json::json!(3));
        assert_eq!(v, Value::Int(3));
        let v = DataType::Time.value_from_json(&serde_json::json!(1700000000.25));
        assert_eq!(v, Value::Int(1700000000));
        let v = DataType::StringList.value_from_json(&serde_json::json!(["a", "b"]));
        assert_eq!(v, Value::StrList(vec!["a".into(), "b".into()]));
        let v = DataType::ServiceList
            .value_from_json(&serde_json::json!([["ping", 2, 1], "http"]));
        assert_eq!(
            v,
            Value::ServiceList(vec![
                ServiceRef {
                    description: "ping".into(),
                    state: 2,
                    has_been_checked: 1
                },
                ServiceRef {
                    description: "http".into(),
                    state: 0,
                    has_been_checked: 0
                },
            ])
        );
    }

    #[test]
    fn custom_variables_accept_both_shapes() {
        let from_obj =
            DataType::CustomVariables.value_from_json(&serde_json::json!({"SITE": "hq"}));
        let from_pairs =
            DataType::CustomVariables.value_from_json(&serde_json::json!([["SITE", "hq"]]));
        assert_eq!(from_obj, from_pairs);
    }

    #[test]
    fn ordering_is_numeric_for_numbers() {
        assert_eq!(
            Value::Int(9).cmp_values(&Value::Float(10.0)),
            Ordering::Less
        );
        assert_eq!(
            Value::Str("9".into()).cmp_values(&Value::Str("10".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn float_rendering_trims_integral_values() {
        assert_eq!(Value::Float(2.0).to_wire_string(), "2");
        assert_eq!(Value::Float(0.25).to_wire_string(), "0.25");
    }
}
