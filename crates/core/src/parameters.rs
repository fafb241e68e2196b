//! Job parameters and the identity key derived from them.
//!
//! Parameters flagged `identifying` form the job instance key: the same job
//! name with the same identifying values always resolves to the same
//! instance. Non-identifying parameters (e.g. where an uploaded payload was
//! stored) can change between attempts without changing identity.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
    /// Opaque handle to an externally stored payload (path or stream id).
    Resource(String),
}

impl ParameterValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "STRING",
            ParameterValue::Long(_) => "LONG",
            ParameterValue::Double(_) => "DOUBLE",
            ParameterValue::Date(_) => "DATE",
            ParameterValue::Resource(_) => "RESOURCE",
        }
    }

    fn canonical(&self) -> String {
        match self {
            ParameterValue::String(s) | ParameterValue::Resource(s) => s.clone(),
            ParameterValue::Long(v) => v.to_string(),
            ParameterValue::Double(v) => format!("{v:?}"),
            ParameterValue::Date(d) => d.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }
}

impl core::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A single named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// Immutable set of job parameters, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.parameters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// String-like value (STRING or RESOURCE).
    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name).map(|p| &p.value) {
            Some(ParameterValue::String(s)) | Some(ParameterValue::Resource(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.get(name).map(|p| &p.value) {
            Some(ParameterValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name).map(|p| &p.value) {
            Some(ParameterValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name).map(|p| &p.value) {
            Some(ParameterValue::Date(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// The subset of parameters that participates in instance identity.
    pub fn identifying(&self) -> JobParameters {
        JobParameters {
            parameters: self
                .parameters
                .iter()
                .filter(|(_, p)| p.identifying)
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Deterministic serialization of the identifying subset.
    ///
    /// Names and values are length-prefixed (`{len}:{bytes}`), so no choice
    /// of names or values can make two different subsets serialize alike.
    pub fn canonical_identity(&self) -> String {
        let mut out = String::new();
        for (name, param) in self.parameters.iter().filter(|(_, p)| p.identifying) {
            let value = param.value.canonical();
            out.push_str(&format!(
                "{}:{name}{}:{}:{value};",
                name.len(),
                param.value.kind(),
                value.len()
            ));
        }
        out
    }

    /// Hex-encoded SHA-256 of [`Self::canonical_identity`].
    pub fn identity_key(&self) -> String {
        let digest = Sha256::digest(self.canonical_identity().as_bytes());
        hex::encode(digest)
    }

    /// True when every identifying parameter of `original` is present here,
    /// still identifying, with the same value.
    pub fn contains_identity_of(&self, original: &JobParameters) -> bool {
        original
            .parameters
            .iter()
            .filter(|(_, p)| p.identifying)
            .all(|(name, p)| {
                self.parameters
                    .get(name)
                    .is_some_and(|mine| mine.identifying && mine.value == p.value)
            })
    }

    /// Parameters of `self` overridden by those in `overrides`.
    pub fn merged_with(&self, overrides: &JobParameters) -> JobParameters {
        let mut parameters = self.parameters.clone();
        for (name, param) in &overrides.parameters {
            parameters.insert(name.clone(), param.clone());
        }
        JobParameters { parameters }
    }
}

/// Builder for [`JobParameters`].
#[derive(Debug, Clone, Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn add(mut self, name: impl Into<String>, value: ParameterValue, identifying: bool) -> Self {
        self.parameters
            .insert(name.into(), JobParameter { value, identifying });
        self
    }

    pub fn add_string(self, name: impl Into<String>, value: impl Into<String>, identifying: bool) -> Self {
        self.add(name, ParameterValue::String(value.into()), identifying)
    }

    pub fn add_long(self, name: impl Into<String>, value: i64, identifying: bool) -> Self {
        self.add(name, ParameterValue::Long(value), identifying)
    }

    pub fn add_double(self, name: impl Into<String>, value: f64, identifying: bool) -> Self {
        self.add(name, ParameterValue::Double(value), identifying)
    }

    pub fn add_date(self, name: impl Into<String>, value: DateTime<Utc>, identifying: bool) -> Self {
        self.add(name, ParameterValue::Date(value), identifying)
    }

    pub fn add_resource(self, name: impl Into<String>, handle: impl Into<String>, identifying: bool) -> Self {
        self.add(name, ParameterValue::Resource(handle.into()), identifying)
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}
