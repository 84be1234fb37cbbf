pub mod compute;
pub mod defaults;
pub mod error;
pub mod job;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod poller;
pub mod remote;
pub mod render;
pub mod state;

pub use compute::{ComputeGateway, Flavor, Image, Instance, InstanceRequest, RequestContext};
pub use error::{HcpError, RemoteError, Result};
pub use job::{CancelToken, JobManager};
pub use orchestrator::{JobOutcome, Orchestrator, OrchestratorConfig};
pub use poller::PollPolicy;
pub use remote::{RemoteExecutor, RemoteSession, SshConfig, SshExecutor};
pub use render::TemplateRenderer;
pub use state::{ClusterStore, StateStore};
