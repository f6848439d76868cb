// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote authority: the external system that decides whether a token is
//! still accepted.
//!
//! Only an explicit rejection counts as an authentication failure. Anything
//! that stops us from getting a clear answer is a transport error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    AuthFailed(String),
    TransportError(String),
}

#[async_trait::async_trait]
pub trait Authority: Send + Sync {
    async fn check(&self, token: &str, category: &str) -> ProbeOutcome;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    #[default]
    Get,
    Post,
}

/// A JSON field that must hold a given value for the probe to count as alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    /// Dot-separated path into the response body, e.g. `data.valid`.
    pub field: String,
    pub equals: Value,
}

/// How to probe one account category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub url: String,
    #[serde(default)]
    pub method: ProbeMethod,
    /// Header that carries the token.
    #[serde(default = "default_header")]
    pub header: String,
    /// Prefix placed before the token, e.g. `Bearer`. Empty for none.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Business-level check. Alive if any entry matches.
    #[serde(default)]
    pub expect: Vec<FieldMatch>,
}

fn default_header() -> String {
    "Authorization".to_owned()
}

fn default_scheme() -> String {
    "Bearer".to_owned()
}

impl ProbeSpec {
    /// Bearer-token GET against `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: ProbeMethod::Get,
            header: default_header(),
            scheme: default_scheme(),
            headers: BTreeMap::new(),
            body: None,
            expect: Vec::new(),
        }
    }

    fn header_value(&self, token: &str) -> String {
        if self.scheme.is_empty() {
            token.to_owned()
        } else {
            format!("{} {token}", self.scheme)
        }
    }
}

/// Probe specs keyed by account category, with an optional fallback.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default)]
    pub default: Option<ProbeSpec>,
    #[serde(default)]
    pub categories: HashMap<String, ProbeSpec>,
}

impl AuthorityConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn single(url: impl Into<String>) -> Self {
        Self { default: Some(ProbeSpec::get(url)), categories: HashMap::new() }
    }

    pub fn spec_for(&self, category: &str) -> Option<&ProbeSpec> {
        self.categories.get(category).or(self.default.as_ref())
    }
}

/// Classify an HTTP response from the authority.
pub fn classify(status: u16, body: &str, spec: &ProbeSpec) -> ProbeOutcome {
    match status {
        401 | 403 => ProbeOutcome::AuthFailed(format!("HTTP {status}")),
        200..=399 => {
            if spec.expect.is_empty() {
                return ProbeOutcome::Alive;
            }
            let Ok(json) = serde_json::from_str::<Value>(body) else {
                return ProbeOutcome::Alive;
            };
            if spec.expect.iter().any(|m| lookup(&json, &m.field) == Some(&m.equals)) {
                ProbeOutcome::Alive
            } else {
                ProbeOutcome::AuthFailed("response did not confirm the token".to_owned())
            }
        }
        other => ProbeOutcome::TransportError(format!("unexpected HTTP {other}")),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// Authority reached over HTTP.
pub struct HttpAuthority {
    client: reqwest::Client,
    config: AuthorityConfig,
}

impl HttpAuthority {
    pub fn new(config: AuthorityConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl Authority for HttpAuthority {
    async fn check(&self, token: &str, category: &str) -> ProbeOutcome {
        let Some(spec) = self.config.spec_for(category) else {
            return ProbeOutcome::TransportError(format!("no probe configured for {category}"));
        };

        let mut req = match spec.method {
            ProbeMethod::Get => self.client.get(&spec.url),
            ProbeMethod::Post => self.client.post(&spec.url),
        };
        req = req.header(spec.header.as_str(), spec.header_value(token));
        for (name, value) in &spec.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = spec.body {
            req = req.json(body);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return ProbeOutcome::TransportError("timeout".to_owned()),
            Err(e) => return ProbeOutcome::TransportError(e.to_string()),
        };
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        classify(status, &body, spec)
    }
}

#[cfg(test)]
#[path = "authority_tests.rs"]
mod tests;
