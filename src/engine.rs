//! The engine: an explicitly-constructed value tying configuration, daemon
//! clients, reporting, and concurrency policy together.
//!
//! Build one with [`Engine::builder`]; there are no process-wide singletons.
//! The same engine value serves plan, apply, prune, and destroy; each call
//! is one reconciliation cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::applier::apply_context;
use crate::cli::CliClient;
use crate::client::DaemonClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::orchestrator::for_each_context;
use crate::plan::{ContextCache, ExecutionContext, Plan, ResourcePlan};
use crate::planner::plan_context;
use crate::prune::{destroy_context, prune_context};
use crate::report::{Reporter, TracingReporter};

/// Produces a daemon client for a named context.
pub type ClientFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn DaemonClient>> + Send + Sync>;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: Config,
    clients: Option<ClientFactory>,
    reporter: Arc<dyn Reporter>,
    parallel: bool,
}

impl EngineBuilder {
    /// Override the daemon client factory; defaults to CLI clients bound to
    /// the context name.
    #[must_use]
    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.clients = Some(factory);
        self
    }

    /// Override the progress reporter; defaults to `tracing`.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run per-context work in parallel (default) or sequentially.
    #[must_use]
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Validate the configuration and construct the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let identifier = self.config.identifier.clone();
        let clients = self.clients.unwrap_or_else(|| {
            Arc::new(move |context: &str| {
                let client = CliClient::new(Some(context.to_string()), identifier.clone())?;
                Ok(Arc::new(client) as Arc<dyn DaemonClient>)
            })
        });
        Ok(Engine {
            config: Arc::new(self.config),
            clients,
            reporter: self.reporter,
            parallel: self.parallel,
        })
    }
}

/// The reconciliation engine.
pub struct Engine {
    config: Arc<Config>,
    clients: ClientFactory,
    reporter: Arc<dyn Reporter>,
    parallel: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine around a configuration.
    #[must_use]
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            clients: None,
            reporter: Arc::new(TracingReporter),
            parallel: true,
        }
    }

    /// The configuration this engine reconciles.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn context_names(&self) -> Vec<String> {
        self.config.contexts.keys().cloned().collect()
    }

    fn client(&self, context: &str) -> Result<Arc<dyn DaemonClient>> {
        (self.clients)(context)
    }

    /// Compute the plan: what apply would do, plus the execution cache that
    /// lets apply skip re-observing the daemon.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<Plan> {
        let names = self.context_names();
        let results: Mutex<BTreeMap<String, (ResourcePlan, ContextCache)>> =
            Mutex::new(BTreeMap::new());

        for_each_context(&names, self.parallel, cancel, |name, _token| {
            let results = &results;
            async move {
                let client = self.client(&name)?;
                let output = plan_context(client.as_ref(), &self.config, &name).await?;
                let mut slots = results
                    .lock()
                    .map_err(|_| Error::internal("engine", "plan results lock poisoned"))?;
                slots.insert(name, output);
                Ok(())
            }
        })
        .await?;

        let slots = results
            .into_inner()
            .map_err(|_| Error::internal("engine", "plan results lock poisoned"))?;
        let mut plan = Plan::default();
        for (name, (resources, cache)) in slots {
            plan.resources.merge(resources);
            plan.execution.contexts.insert(name, cache);
        }

        let summary = plan.summary();
        self.reporter.info(&format!(
            "plan: {} to create, {} to update, {} to delete, {} to reconcile, {} unchanged",
            summary.create, summary.update, summary.delete, summary.reconcile, summary.noop
        ));
        Ok(plan)
    }

    /// Converge every context to the desired state, reusing the plan's
    /// execution cache.
    pub async fn apply(&self, plan: &Plan, cancel: &CancellationToken) -> Result<()> {
        self.apply_with(Some(&plan.execution), cancel).await
    }

    /// Converge without a prior plan; every observation is made fresh.
    pub async fn apply_fresh(&self, cancel: &CancellationToken) -> Result<()> {
        self.apply_with(None, cancel).await
    }

    async fn apply_with(
        &self,
        execution: Option<&ExecutionContext>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names = self.context_names();
        for_each_context(&names, self.parallel, cancel, |name, token| async move {
            let client = self.client(&name)?;
            let cache = execution.and_then(|e| e.contexts.get(&name));
            apply_context(client.as_ref(), &self.config, &name, cache, &token).await
        })
        .await?;
        self.reporter.info("apply: all contexts converged");
        Ok(())
    }

    /// Remove managed resources the manifest no longer wants.
    ///
    /// With `strict` set, the first failure aborts; otherwise failures are
    /// aggregated into a warning and prune reports success.
    pub async fn prune(
        &self,
        plan: Option<&Plan>,
        strict: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names = self.context_names();
        for_each_context(&names, self.parallel, cancel, |name, _token| async move {
            let client = self.client(&name)?;
            let cache = plan.and_then(|p| p.execution.contexts.get(&name));
            prune_context(client.as_ref(), &self.config, &name, cache, strict).await
        })
        .await
    }

    /// Remove every managed resource, desired or not.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        let names = self.context_names();
        for_each_context(&names, self.parallel, cancel, |name, _token| async move {
            let client = self.client(&name)?;
            destroy_context(client.as_ref(), &name).await
        })
        .await?;
        self.reporter.info("destroy: all managed resources removed");
        Ok(())
    }
}
