//! HTTP tunnel client (v0.1)
//!
//! Mirror image of the exposure contract: forwards `run_task`/`emit_event`
//! calls to a remote runtime over HTTP, presenting the shared-secret
//! token and unwrapping the `{ok, result | error}` envelope.

use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{json, Value};
use url::Url;

use crate::builders::resource;
use crate::error::WeftError;
use crate::types::{UnitId, UnitKind};
use crate::unit::ResourceDef;

use super::{TunnelPolicy, DEFAULT_TOKEN_HEADER};

/// Thin client forwarding surface calls to a remote runtime
#[derive(Debug, Clone)]
pub struct TunnelClient {
    base_url: Url,
    token: Option<String>,
    header_name: String,
    http: reqwest::Client,
}

impl TunnelClient {
    /// `base_url` must include the remote base path
    /// (`http://host:port/__runtime`)
    pub fn new(base_url: &str) -> Result<Self, WeftError> {
        let mut parsed = Url::parse(base_url).map_err(|e| WeftError::DefinitionInvalid {
            id: base_url.to_string(),
            reason: format!("invalid tunnel base url: {e}"),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(WeftError::DefinitionInvalid {
                    id: base_url.to_string(),
                    reason: format!("tunnel transport must be http(s), got '{other}'"),
                })
            }
        }
        // A trailing slash keeps Url::join from eating the last segment.
        if !parsed.path().ends_with('/') {
            parsed.set_path(&format!("{}/", parsed.path()));
        }

        Ok(Self {
            base_url: parsed,
            token: None,
            header_name: DEFAULT_TOKEN_HEADER.into(),
            http: reqwest::Client::new(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    /// Forward a task call; resolves with the remote result
    pub async fn run_task(&self, id: &str, input: Value) -> Result<Value, WeftError> {
        let body = json!({"input": input});
        self.post(&format!("task/{id}"), id, body).await
    }

    /// Forward an event emission
    pub async fn emit_event(&self, id: &str, payload: Value) -> Result<(), WeftError> {
        let body = json!({"payload": payload});
        self.post(&format!("event/{id}"), id, body).await.map(|_| ())
    }

    async fn post(&self, path: &str, id: &str, body: Value) -> Result<Value, WeftError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| WeftError::User(anyhow!("invalid tunnel path: {e}")))?;

        let mut request = self.http.post(url).json(&body);
        if let Some(token) = &self.token {
            request = request.header(self.header_name.as_str(), token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WeftError::User(anyhow!("tunnel transport error: {e}")))?;
        let status = response.status();
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| WeftError::User(anyhow!("tunnel response is not JSON: {e}")))?;

        if status.is_success() && envelope["ok"] == json!(true) {
            return Ok(envelope.get("result").cloned().unwrap_or(Value::Null));
        }

        // Mirror the remote error as faithfully as the envelope allows.
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Ok(unit_id) = UnitId::new(id) {
                return Err(WeftError::UnknownUnit {
                    id: unit_id,
                    kind: UnitKind::Task,
                });
            }
        }
        let code = envelope["error"]["code"].as_str().unwrap_or("UNKNOWN");
        let message = envelope["error"]["message"]
            .as_str()
            .unwrap_or("tunnel call failed");
        Err(WeftError::User(anyhow!(
            "tunnel remote error [{code}] ({status}): {message}"
        )))
    }
}

/// A client-mode tunnel as a resource: its value is a [`TunnelClient`]
/// wired from the registration config `{ "baseUrl": …, "token"?: … }`,
/// tagged `tunnel` with the given policy.
pub fn client_resource(id: &str, policy: TunnelPolicy) -> Result<Arc<ResourceDef>, WeftError> {
    let def = resource(id)
        .tag(super::tunnel_tag().with(policy.to_config()))
        .config_schema(json!({
            "type": "object",
            "properties": {
                "baseUrl": {"type": "string"},
                "token": {"type": "string"},
            },
            "required": ["baseUrl"],
        }))
        .init(|config, _deps| async move {
            let base_url = config["baseUrl"].as_str().unwrap_or_default().to_string();
            let mut client = TunnelClient::new(&base_url).map_err(|e| anyhow!(e.to_string()))?;
            if let Some(token) = config["token"].as_str() {
                client = client.with_token(token);
            }
            Ok(client)
        })
        .build()?;
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        let err = TunnelClient::new("ftp://remote/__runtime").unwrap_err();
        assert_eq!(err.kind(), "definition.invalid");
    }

    #[test]
    fn normalizes_trailing_slash() {
        let client = TunnelClient::new("http://remote:8080/__runtime").unwrap();
        assert!(client.base_url.path().ends_with('/'));
    }

    #[test]
    fn client_resource_is_tunnel_tagged() {
        let def = client_resource("edge-client", TunnelPolicy::client(vec!["t".into()], vec![]))
            .unwrap();
        assert!(super::super::tunnel_tag().is_on(&def.tags));
        assert!(def.config_schema.is_some());
    }
}
