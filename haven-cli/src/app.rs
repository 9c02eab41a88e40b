//! Wiring of the core services for one CLI invocation.

use anyhow::{Context as _, Result};
use haven_core::{
    CliProvisioner, Config, ConfigStore, Context, ContextRegistry, FsRemoteStore, KeyFile, SecretProvisioner,
    StackOrchestrator, StateManager,
};
use std::sync::Arc;
use tracing::debug;

/// Services bound to one deployment context.
pub struct App {
    pub context: Context,
    pub store: ConfigStore,
    pub orchestrator: StackOrchestrator,
}

impl App {
    pub async fn open(config: Config, context_name: &str) -> Result<Self> {
        let registry = ContextRegistry::load(config.contexts_path())?;
        let context = registry
            .get(context_name)
            .with_context(|| format!("Unknown context; create it with `haven context create {}`", context_name))?
            .clone();

        let state = StateManager::new(config.db_path()).await.context("Failed to open local state")?;
        let store = ConfigStore::new(Arc::new(FsRemoteStore::new(&config.remote_store_dir)));

        let provisioner = CliProvisioner::new(&config.provisioner_program, &config.provisioner_work_dir)
            .with_program_args(config.provisioner_args.clone());
        let secrets = SecretProvisioner::new(state.clone(), Arc::new(KeyFile::new(config.key_path())));

        let orchestrator = StackOrchestrator::new(state, store.clone(), Arc::new(provisioner), secrets)
            .with_lease_ttl(config.lease_ttl());

        debug!(context = %context.name(), data_dir = %config.data_dir, "Opened haven state");

        Ok(Self { context, store, orchestrator })
    }
}
