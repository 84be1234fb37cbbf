use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Request-scoped tenant credentials. The core never interprets them, it only
/// hands them to the compute gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub token: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn for_tenant(tenant_id: &str) -> Self {
        RequestContext {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
}

/// A VM as the compute provider reports it. `addresses` are in the order the
/// provider lists them; the first is the internal address and, once a
/// floating address is attached, the last is the external one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Instance {
    /// `(internal, external)` once the VM has both.
    pub fn ip_pair(&self) -> Option<(String, String)> {
        if self.addresses.len() < 2 {
            return None;
        }
        let internal = self.addresses.first()?.clone();
        let external = self.addresses.last()?.clone();
        Some((internal, external))
    }
}

/// Adapter to the cloud compute API.
#[async_trait]
pub trait ComputeGateway: Send + Sync {
    async fn find_image_by_id(&self, ctx: &RequestContext, id: &str) -> Result<Image>;

    async fn find_flavor_by_name_or_id(&self, ctx: &RequestContext, reference: &str)
    -> Result<Flavor>;

    /// Launches a VM and returns as soon as the provider has assigned an id.
    async fn create_instance(
        &self,
        ctx: &RequestContext,
        request: InstanceRequest,
    ) -> Result<Instance>;

    async fn list_instances(&self, ctx: &RequestContext) -> Result<Vec<Instance>>;

    async fn delete_instance(&self, ctx: &RequestContext, id: &str) -> Result<()>;
}
