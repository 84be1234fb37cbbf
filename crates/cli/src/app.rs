use std::sync::Arc;

use hcp_core::error::Result;
use hcp_core::{JobManager, Orchestrator, SshExecutor, StateStore, TemplateRenderer};
use hcp_openstack::Nova;

use crate::config::Config;

/// Everything a cluster command needs, wired from the config file.
pub struct App {
    pub store: Arc<StateStore>,
    pub manager: JobManager,
}

impl App {
    pub fn new(config: &Config) -> Result<App> {
        let store = Arc::new(StateStore::open_default()?);
        let compute = Arc::new(Nova::new(config.nova())?);
        let executor = Arc::new(SshExecutor::new(config.ssh()?));
        let orchestrator = Orchestrator::new(
            store.clone(),
            compute,
            executor,
            TemplateRenderer::with_builtin(),
            config.orchestrator()?,
        );
        Ok(App {
            store,
            manager: JobManager::new(Arc::new(orchestrator)),
        })
    }
}
