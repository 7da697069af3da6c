//! Controller wiring for CompositionDefinitions

use std::sync::Arc;
use std::time::Duration;

use compositor_core::CompositionDefinition;
use compositor_engine::TemplateRenderer;
use compositor_kube::{
    ClusterApi, Collaborators, FileCertificateManager, KubeCluster, KubeError, OpenApiCompiler,
    Outcome, Reconciler, RetryPolicy,
};
use compositor_repo::HttpChartResolver;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::error::Result;

/// Shared state handed to every reconcile call
pub struct Context {
    pub reconciler: Reconciler,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub reconcile_timeout: Duration,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        collaborators: Collaborators,
        config: &OperatorConfig,
    ) -> Self {
        let reconciler = Reconciler::new(
            cluster,
            collaborators,
            RetryPolicy::with_max_attempts(config.max_retries),
        )
        .strict_compatibility(config.strict_compatibility);
        Self {
            reconciler,
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            reconcile_timeout: config.reconcile_timeout(),
        }
    }

    /// Context backed by the cluster and the production collaborators
    pub fn from_config(client: Client, config: &OperatorConfig) -> Result<Self> {
        let collaborators = Collaborators {
            resolver: Arc::new(HttpChartResolver::new(config.max_chart_size)),
            compiler: Arc::new(OpenApiCompiler::new()),
            renderer: Arc::new(TemplateRenderer::new(config.controller_image_ref())?),
            certs: Arc::new(FileCertificateManager::new(
                &config.tls_cert_dir,
                &config.webhook_service_name,
                &config.webhook_service_namespace,
            )),
        };
        Ok(Self::new(
            Arc::new(KubeCluster::new(client)),
            collaborators,
            config,
        ))
    }
}

/// Watch CompositionDefinitions until a shutdown signal arrives
pub async fn run(client: Client, config: OperatorConfig) -> Result<()> {
    let definitions: Api<CompositionDefinition> = match config.watch_namespace() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let ctx = Arc::new(Context::from_config(client, &config)?);

    info!(
        namespace = config.watch_namespace().unwrap_or("*"),
        poll_interval = config.poll_interval,
        strict_compatibility = config.strict_compatibility,
        "Starting CompositionDefinition controller"
    );

    Controller::new(definitions, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!(name = %obj.name, "Reconcile finished"),
                Err(e) => debug!(error = %e, "Reconcile did not complete"),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

async fn reconcile(
    definition: Arc<CompositionDefinition>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, KubeError> {
    let name = definition.name_any();
    let namespace = definition.namespace().unwrap_or_default();

    let outcome = tokio::time::timeout(
        ctx.reconcile_timeout,
        ctx.reconciler.reconcile(&definition),
    )
    .await
    .map_err(|_| {
        KubeError::Timeout(format!(
            "{:?} reconciling {}/{}",
            ctx.reconcile_timeout, namespace, name
        ))
    })??;

    info!(%name, %namespace, %outcome, "Reconciled");
    Ok(next_action(outcome, &ctx))
}

fn next_action(outcome: Outcome, ctx: &Context) -> Action {
    match outcome {
        Outcome::Deleted => Action::await_change(),
        _ => Action::requeue(ctx.poll_interval),
    }
}

fn error_policy(
    definition: Arc<CompositionDefinition>,
    error: &KubeError,
    ctx: Arc<Context>,
) -> Action {
    let name = definition.name_any();
    let namespace = definition.namespace().unwrap_or_default();
    if error.is_blocking() {
        info!(%name, %namespace, reason = %error, "Deletion waiting, requeuing");
    } else {
        warn!(
            %name,
            %namespace,
            %error,
            backoff = ?ctx.error_backoff,
            "Reconcile failed, requeuing"
        );
    }
    Action::requeue(ctx.error_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use compositor_core::Gvr;
    use compositor_kube::MockCluster;
    use compositor_kube::testing::{MockCertificateManager, MockChartResolver, fireworks_definition};

    fn context(cluster: &MockCluster) -> Context {
        let config =
            OperatorConfig::try_parse_from(["compositor", "--poll-interval", "60"]).unwrap();
        let collaborators = Collaborators {
            resolver: Arc::new(MockChartResolver::fireworks(&["1.1.13"])),
            compiler: Arc::new(OpenApiCompiler::new()),
            renderer: Arc::new(TemplateRenderer::new(config.controller_image_ref()).unwrap()),
            certs: Arc::new(MockCertificateManager::default()),
        };
        Context::new(Arc::new(cluster.clone()), collaborators, &config)
    }

    #[tokio::test]
    async fn test_reconcile_requeues_after_poll_interval() {
        let cluster = MockCluster::new();
        let def = fireworks_definition("fireworks", "krateo-system", "1.1.13");
        cluster.add_definition(def.clone());
        let ctx = Arc::new(context(&cluster));

        let action = reconcile(Arc::new(def), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert!(cluster.crd("fireworksapps.composition.krateo.io").is_some());
    }

    #[tokio::test]
    async fn test_error_policy_backs_off() {
        let cluster = MockCluster::new();
        let ctx = Arc::new(context(&cluster));
        let def = Arc::new(fireworks_definition("fireworks", "krateo-system", "1.1.13"));

        let blocking = KubeError::CompositionsStillExist {
            gvr: Gvr::new("composition.krateo.io", "v1-1-13", "fireworksapps").to_string(),
            count: 2,
        };
        assert_eq!(
            error_policy(def.clone(), &blocking, ctx.clone()),
            Action::requeue(Duration::from_secs(15))
        );

        let failure = KubeError::Timeout("1s".to_string());
        assert_eq!(
            error_policy(def, &failure, ctx),
            Action::requeue(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_deleted_definitions_wait_for_changes() {
        let cluster = MockCluster::new();
        let ctx = context(&cluster);
        assert_eq!(next_action(Outcome::Deleted, &ctx), Action::await_change());
        assert_eq!(
            next_action(Outcome::UpToDate, &ctx),
            Action::requeue(Duration::from_secs(60))
        );
    }
}
