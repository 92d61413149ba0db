//! Result row shapes returned by the backend
//!
//! Aggregate fields such as `_count`, `_min` and `_max` arrive as strings.

use serde::Deserialize;

/// A numeric aggregate that may be encoded as a JSON number or string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Numeric::Int(n) => Some(*n),
            Numeric::Float(f) => f.is_finite().then_some(*f as i64),
            Numeric::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f as i64)
                })
            }
        }
    }

    /// Original text, for error messages
    pub fn raw(&self) -> String {
        match self {
            Numeric::Int(n) => n.to_string(),
            Numeric::Float(f) => f.to_string(),
            Numeric::Text(s) => s.clone(),
        }
    }
}

/// One stored event, or one session row of collected payloads
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadRow {
    pub traceid: String,
    #[serde(default)]
    pub payload: String,
}

/// Candidate trace with the time range it was seen in (epoch ms)
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateRow {
    pub traceid: String,
    #[serde(rename = "_min", default)]
    pub min: Option<Numeric>,
    #[serde(rename = "_max", default)]
    pub max: Option<Numeric>,
}

/// Service with its grouped operation
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRow {
    #[serde(rename = "#service")]
    pub service: String,
    #[serde(default)]
    pub operation: Option<String>,
}

/// Parent/child service pair from the dependency join
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyRow {
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub child: String,
    #[serde(rename = "_count")]
    pub count: Numeric,
}
