//! Password authentication against the Keystone v2 `tokens` endpoint.

use hcp_core::error::{HcpError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A token and the compute endpoint the service catalog advertised with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Session {
    pub token: String,
    pub compute_url: Option<String>,
}

pub(crate) struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub tenant_name: Option<&'a str>,
    pub tenant_id: &'a str,
    pub region: Option<&'a str>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    auth: AuthBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthBody<'a> {
    password_credentials: PasswordCredentials<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Access {
    token: Token,
    #[serde(default)]
    service_catalog: Vec<Service>,
}

#[derive(Deserialize)]
struct Token {
    id: String,
}

#[derive(Deserialize)]
struct Service {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

impl<'a> TokenRequest<'a> {
    fn new(credentials: &'a Credentials<'a>) -> Self {
        // Keystone wants exactly one of tenantName / tenantId.
        let tenant_id = match credentials.tenant_name {
            Some(_) => None,
            None => Some(credentials.tenant_id),
        };
        TokenRequest {
            auth: AuthBody {
                password_credentials: PasswordCredentials {
                    username: credentials.username,
                    password: credentials.password,
                },
                tenant_name: credentials.tenant_name,
                tenant_id,
            },
        }
    }
}

impl Access {
    fn into_session(self, region: Option<&str>) -> Session {
        let compute_url = self
            .service_catalog
            .into_iter()
            .filter(|s| s.kind == "compute")
            .flat_map(|s| s.endpoints)
            .find(|e| region.is_none_or(|r| e.region.as_deref() == Some(r)))
            .map(|e| e.public_url.trim_end_matches('/').to_string());
        Session {
            token: self.token.id,
            compute_url,
        }
    }
}

pub(crate) async fn authenticate(
    client: &Client,
    identity_url: &str,
    credentials: &Credentials<'_>,
) -> Result<Session> {
    let url = format!("{}/tokens", identity_url.trim_end_matches('/'));
    debug!(url = %url, user = credentials.username, "requesting keystone token");

    let response = client
        .post(&url)
        .header("accept", "application/json")
        .json(&TokenRequest::new(credentials))
        .send()
        .await
        .map_err(|e| HcpError::Compute(format!("Identity request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(HcpError::Compute(format!(
            "Identity API Error ({}): {}",
            status, text
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| HcpError::Compute(format!("Failed to parse token response: {}", e)))?;
    Ok(token.access.into_session(credentials.region))
}
