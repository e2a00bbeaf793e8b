//! Dynamic value type shared by ingest rows, VM operand stack slots, and
//! query results. Replaces the source's `cjson` values with a tagged union,
//! per the design notes' "dynamic values -> tagged union" strategy.

use std::cmp::Ordering;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::schema::ColumnType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Val {
    Null,
    Bool(bool),
    Int(i64),
    Double(OrderedFloat<f64>),
    Text(String),
    List(Vec<Val>),
}

impl Val {
    pub fn get_type(&self) -> Option<ColumnType> {
        match self {
            Val::Null => None,
            Val::Bool(_) => Some(ColumnType::Bool),
            Val::Int(_) => Some(ColumnType::Int),
            Val::Double(_) => Some(ColumnType::Double),
            Val::Text(_) => Some(ColumnType::Text),
            Val::List(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::Int(i) => Some(*i),
            Val::Double(d) => Some(d.0 as i64),
            Val::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Int(i) => Some(*i as f64),
            Val::Double(d) => Some(d.0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            Val::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn from_json(json: &Json) -> Val {
        match json {
            Json::Null => Val::Null,
            Json::Bool(b) => Val::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Val::Int(i)
                } else {
                    Val::Double(OrderedFloat(n.as_f64().unwrap_or(0.0)))
                }
            }
            Json::String(s) => Val::Text(s.clone()),
            Json::Array(a) => Val::List(a.iter().map(Val::from_json).collect()),
            Json::Object(_) => Val::Text(json.to_string()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Val::Null => Json::Null,
            Val::Bool(b) => Json::Bool(*b),
            Val::Int(i) => Json::from(*i),
            Val::Double(d) => serde_json::Number::from_f64(d.0)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Val::Text(s) => Json::String(s.clone()),
            Val::List(l) => Json::Array(l.iter().map(Val::to_json).collect()),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Val::Null => write!(f, "null"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int(i) => write!(f, "{i}"),
            Val::Double(d) => write!(f, "{}", d.0),
            Val::Text(s) => write!(f, "{s:?}"),
            Val::List(l) => write!(f, "{l:?}"),
        }
    }
}

impl PartialOrd for Val {
    fn partial_cmp(&self, other: &Val) -> Option<Ordering> {
        match (self, other) {
            (Val::Int(a), Val::Int(b)) => a.partial_cmp(b),
            (Val::Double(a), Val::Double(b)) => a.partial_cmp(b),
            (Val::Int(a), Val::Double(b)) => (*a as f64).partial_cmp(&b.0),
            (Val::Double(a), Val::Int(b)) => a.0.partial_cmp(&(*b as f64)),
            (Val::Text(a), Val::Text(b)) => a.partial_cmp(b),
            (Val::Bool(a), Val::Bool(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}
