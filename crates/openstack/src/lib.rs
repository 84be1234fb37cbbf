//! Compute gateway backed by the OpenStack compute (Nova v2) REST API.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use hcp_core::error::{HcpError, Result};
use hcp_core::{ComputeGateway, Flavor, Image, Instance, InstanceRequest, RequestContext};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

mod keystone;

use keystone::{Credentials, Session};

/// Connection settings for the compute and identity services.
#[derive(Debug, Clone, Default)]
pub struct NovaConfig {
    /// Compute API root without the tenant segment, e.g. `http://nova:8774/v2`.
    /// When unset the endpoint comes from the Keystone service catalog.
    pub compute_url: Option<String>,
    /// Keystone v2 root, e.g. `http://keystone:5000/v2.0`.
    pub identity_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant_name: Option<String>,
    /// Pre-issued token used when the request context carries none.
    pub token: Option<String>,
    pub region: Option<String>,
}

impl NovaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compute_url.is_none() && self.identity_url.is_none() {
            return Err(HcpError::Config(
                "compute-url or identity-url is required, set it in your hcp config".into(),
            ));
        }
        if self.token.is_some() && self.compute_url.is_none() {
            return Err(HcpError::Config(
                "compute-url is required when a token is configured".into(),
            ));
        }
        if self.identity_url.is_some() && (self.username.is_none() || self.password.is_none()) {
            return Err(HcpError::Config(
                "username and password are required with identity-url".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how a single request is sent.
struct Target {
    base: String,
    token: String,
    /// Came from Keystone and may be refreshed on a 401.
    renewable: bool,
}

pub struct Nova {
    config: NovaConfig,
    client: Client,
    sessions: RwLock<HashMap<String, Session>>,
}

#[derive(Deserialize)]
struct ImageEnvelope {
    image: Named,
}

#[derive(Deserialize)]
struct FlavorEnvelope {
    flavor: Named,
}

#[derive(Deserialize)]
struct FlavorList {
    flavors: Vec<Named>,
}

#[derive(Deserialize)]
struct Named {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Serialize)]
struct CreateServer<'a> {
    server: ServerSpec<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerSpec<'a> {
    name: &'a str,
    image_ref: &'a str,
    flavor_ref: &'a str,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<ServerAddress>>,
}

#[derive(Deserialize)]
struct ServerAddress {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}

impl From<Server> for Instance {
    /// Fixed addresses first and floating ones last, whatever network they
    /// were reported under.
    fn from(server: Server) -> Self {
        let (floating, fixed): (Vec<_>, Vec<_>) = server
            .addresses
            .into_values()
            .flatten()
            .partition(|a| a.kind.as_deref() == Some("floating"));
        Instance {
            id: server.id,
            name: server.name,
            addresses: fixed.into_iter().chain(floating).map(|a| a.addr).collect(),
        }
    }
}

impl Nova {
    pub fn new(config: NovaConfig) -> Result<Nova> {
        config.validate()?;
        Ok(Nova {
            config,
            client: Client::new(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    async fn target(&self, ctx: &RequestContext) -> Result<Target> {
        if let Some(token) = ctx.token.clone().or_else(|| self.config.token.clone()) {
            let root = self.config.compute_url.as_deref().ok_or_else(|| {
                HcpError::Config("compute-url is required when authenticating with a token".into())
            })?;
            return Ok(Target {
                base: tenant_endpoint(root, &ctx.tenant_id),
                token,
                renewable: false,
            });
        }

        let session = self.session(ctx).await?;
        let base = match (&self.config.compute_url, session.compute_url) {
            (Some(root), _) => tenant_endpoint(root, &ctx.tenant_id),
            (None, Some(url)) => url,
            (None, None) => {
                return Err(HcpError::Compute(
                    "no compute endpoint in the service catalog".into(),
                ));
            }
        };
        Ok(Target {
            base,
            token: session.token,
            renewable: true,
        })
    }

    async fn session(&self, ctx: &RequestContext) -> Result<Session> {
        if let Some(session) = self.sessions.read().await.get(&ctx.tenant_id) {
            return Ok(session.clone());
        }

        let missing = |field: &str| HcpError::Config(format!("{} is required to authenticate", field));
        let identity_url = self.config.identity_url.as_deref().ok_or_else(|| missing("identity-url"))?;
        let credentials = Credentials {
            username: self.config.username.as_deref().ok_or_else(|| missing("username"))?,
            password: self.config.password.as_deref().ok_or_else(|| missing("password"))?,
            tenant_name: self.config.tenant_name.as_deref(),
            tenant_id: &ctx.tenant_id,
            region: self.config.region.as_deref(),
        };
        let session = keystone::authenticate(&self.client, identity_url, &credentials).await?;
        info!(tenant_id = %ctx.tenant_id, "authenticated with keystone");

        self.sessions
            .write()
            .await
            .insert(ctx.tenant_id.clone(), session.clone());
        Ok(session)
    }

    async fn send<B: Serialize + Sync>(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let target = self.target(ctx).await?;
        let response = self.dispatch(ctx, &target, method.clone(), path, body).await?;
        if response.status() != StatusCode::UNAUTHORIZED || !target.renewable {
            return Ok(response);
        }

        debug!(tenant_id = %ctx.tenant_id, "token rejected, re-authenticating");
        self.sessions.write().await.remove(&ctx.tenant_id);
        let target = self.target(ctx).await?;
        self.dispatch(ctx, &target, method, path, body).await
    }

    async fn dispatch<B: Serialize + Sync>(
        &self,
        ctx: &RequestContext,
        target: &Target,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let url = format!("{}/{}", target.base, path);
        debug!(method = %method, url = %url, "compute request");

        let mut request = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", &target.token)
            .header("accept", "application/json");
        for (name, value) in &ctx.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| HcpError::Compute(format!("Request failed: {}", e)))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        path: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<T> {
        let response = self.send(ctx, Method::GET, path, None::<&()>).await?;
        parse(check(response, kind, id).await?).await
    }
}

fn tenant_endpoint(root: &str, tenant_id: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), tenant_id)
}

async fn check(response: Response, kind: &'static str, id: &str) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(HcpError::not_found(kind, id));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(HcpError::Compute(format!("API Error ({}): {}", status, text)));
    }
    Ok(response)
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| HcpError::Compute(format!("Failed to parse response: {}", e)))
}

#[async_trait]
impl ComputeGateway for Nova {
    async fn find_image_by_id(&self, ctx: &RequestContext, id: &str) -> Result<Image> {
        let envelope: ImageEnvelope = self.get(ctx, &format!("images/{}", id), "image", id).await?;
        Ok(Image {
            id: envelope.image.id,
            name: envelope.image.name,
        })
    }

    async fn find_flavor_by_name_or_id(
        &self,
        ctx: &RequestContext,
        reference: &str,
    ) -> Result<Flavor> {
        let by_id: Result<FlavorEnvelope> = self
            .get(ctx, &format!("flavors/{}", reference), "flavor", reference)
            .await;
        let flavor = match by_id {
            Ok(envelope) => envelope.flavor,
            Err(e) if e.is_not_found() => {
                let list: FlavorList = self.get(ctx, "flavors/detail", "flavor", reference).await?;
                list.flavors
                    .into_iter()
                    .find(|f| f.name == reference)
                    .ok_or_else(|| HcpError::not_found("flavor", reference))?
            }
            Err(e) => return Err(e),
        };
        Ok(Flavor {
            id: flavor.id,
            name: flavor.name,
        })
    }

    async fn create_instance(
        &self,
        ctx: &RequestContext,
        request: InstanceRequest,
    ) -> Result<Instance> {
        let payload = CreateServer {
            server: ServerSpec {
                name: &request.name,
                image_ref: &request.image_id,
                flavor_ref: &request.flavor_id,
            },
        };
        let response = self.send(ctx, Method::POST, "servers", Some(&payload)).await?;
        let envelope: ServerEnvelope = parse(check(response, "server", &request.name).await?).await?;

        let mut instance = Instance::from(envelope.server);
        if instance.name.is_empty() {
            instance.name = request.name;
        }
        info!(instance_id = %instance.id, name = %instance.name, "instance launched");
        Ok(instance)
    }

    async fn list_instances(&self, ctx: &RequestContext) -> Result<Vec<Instance>> {
        let list: ServerList = self.get(ctx, "servers/detail", "server", "detail").await?;
        Ok(list.servers.into_iter().map(Instance::from).collect())
    }

    async fn delete_instance(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let response = self
            .send(ctx, Method::DELETE, &format!("servers/{}", id), None::<&()>)
            .await?;
        check(response, "server", id).await?;
        info!(instance_id = %id, "instance deleted");
        Ok(())
    }
}
