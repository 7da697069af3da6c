//! End-to-end reconciliation against the in-memory cluster

use compositor_core::labels::VERSION_LABEL;
use compositor_core::{
    ChartCredentials, ChartRef, CompositionDefinitionSpec, Gvr, NamespacedName, ObjectKey,
    SecretKeyRef,
};
use compositor_kube::crd::{storage_versions, version_names};
use compositor_kube::testing::{
    StaticRenderer, TestHarness, fireworks_definition, fireworks_url, workload_name,
};
use compositor_kube::{CLEANUP_FINALIZER, COMPOSITIONS_FINALIZER, KubeError, Outcome, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use serde_json::json;

const NAMESPACE: &str = "krateo-system";
const CRD_NAME: &str = "fireworksapps.composition.krateo.io";

fn gvr(version: &str) -> Gvr {
    Gvr::new("composition.krateo.io", version, "fireworksapps")
}

fn deployment(version: &str) -> ObjectKey {
    ObjectKey::new(
        "apps/v1",
        "Deployment",
        Some(NAMESPACE),
        workload_name(&gvr(version)),
    )
}

fn cluster_role(version: &str) -> ObjectKey {
    ObjectKey::new(
        "rbac.authorization.k8s.io/v1",
        "ClusterRole",
        None,
        workload_name(&gvr(version)),
    )
}

fn install(h: &TestHarness, name: &str, version: &str) -> NamespacedName {
    let def = fireworks_definition(name, NAMESPACE, version);
    let nn = def.namespaced_name();
    h.cluster.add_definition(def);
    nn
}

async fn reconcile(h: &TestHarness, nn: &NamespacedName) -> Result<Outcome> {
    let def = h.cluster.definition(nn).expect("definition exists");
    h.reconciler.reconcile(&def).await
}

fn upgrade(h: &TestHarness, nn: &NamespacedName, version: &str) {
    h.cluster.update_definition_spec(
        nn,
        CompositionDefinitionSpec {
            chart: ChartRef::new(fireworks_url(version), version),
        },
    );
}

#[tokio::test]
async fn test_create_then_up_to_date() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let nn = install(&h, "fireworksapp", "1.1.13");

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Created);

    let crd = h.cluster.crd(CRD_NAME).expect("CRD created");
    assert_eq!(version_names(&crd), vec!["v1-1-13"]);
    assert!(h.cluster.object(&deployment("v1-1-13")).is_some());
    assert_eq!(h.certs.managed(), vec![gvr("v1-1-13")]);

    let def = h.cluster.definition(&nn).unwrap();
    assert!(def.finalizers_list().contains(&CLEANUP_FINALIZER.to_string()));
    let status = def.status.as_ref().unwrap();
    assert_eq!(status.api_version.as_deref(), Some("composition.krateo.io/v1-1-13"));
    assert_eq!(status.kind.as_deref(), Some("FireworksApp"));
    assert_eq!(status.resource.as_deref(), Some("fireworksapps"));
    assert_eq!(status.package_url.as_deref(), Some(fireworks_url("1.1.13").as_str()));
    assert!(status.digest.is_some());
    assert!(status.error.is_none());

    h.cluster.reset_counts();
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::UpToDate);
    assert_eq!(h.cluster.operation_counts().applies, 0);
    assert!(h.cluster.definition(&nn).unwrap().status.unwrap().is_available());
}

#[tokio::test]
async fn test_version_migration() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    h.cluster
        .add_instance(&gvr("v1-1-13"), "FireworksApp", "demo", "fireworks-1", Some("v1-1-13"), &[]);
    h.cluster
        .add_instance(&gvr("v1-1-13"), "FireworksApp", "demo", "fireworks-2", Some("v1-1-13"), &[]);

    upgrade(&h, &nn, "1.1.14");
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);

    let crd = h.cluster.crd(CRD_NAME).unwrap();
    assert_eq!(version_names(&crd), vec!["v1-1-13", "v1-1-14", "vacuum"]);
    assert_eq!(storage_versions(&crd), vec!["vacuum"]);

    let def = h.cluster.definition(&nn).unwrap();
    let status = def.status.as_ref().unwrap();
    let info = status.version_info();
    assert_eq!(info.len(), 3);
    let v13 = info.iter().find(|v| v.version == "v1-1-13").unwrap();
    assert!(v13.served && !v13.stored);
    assert_eq!(v13.chart.as_ref().map(|c| c.version.as_str()), Some("1.1.13"));
    let vacuum = info.iter().find(|v| v.version == "vacuum").unwrap();
    assert!(!vacuum.served && vacuum.stored && vacuum.chart.is_none());
    assert_eq!(status.api_version.as_deref(), Some("composition.krateo.io/v1-1-14"));

    assert!(h.cluster.object(&deployment("v1-1-13")).is_none());
    assert!(h.cluster.object(&cluster_role("v1-1-13")).is_none());
    assert!(h.cluster.object(&deployment("v1-1-14")).is_some());

    for instance in h.cluster.instances("composition.krateo.io", "fireworksapps") {
        assert_eq!(instance.label(VERSION_LABEL), Some("v1-1-14"));
    }
    assert!(def.finalizers_list().contains(&COMPOSITIONS_FINALIZER.to_string()));

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::UpToDate);
}

#[tokio::test]
async fn test_version_info_is_monotonic() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14", "1.1.15"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    let mut previous: Vec<String> = Vec::new();
    for version in ["1.1.14", "1.1.15"] {
        upgrade(&h, &nn, version);
        reconcile(&h, &nn).await.unwrap();

        let def = h.cluster.definition(&nn).unwrap();
        let versions: Vec<String> = def
            .status
            .as_ref()
            .unwrap()
            .version_info()
            .iter()
            .map(|v| v.version.clone())
            .collect();
        assert!(versions.starts_with(&previous));
        previous = versions;
    }
    assert_eq!(previous.len(), 4);

    let crd = h.cluster.crd(CRD_NAME).unwrap();
    assert_eq!(storage_versions(&crd), vec!["vacuum"]);
}

#[tokio::test]
async fn test_deployment_drift_is_repaired() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    assert!(
        h.cluster
            .tamper_object(&deployment("v1-1-13"), |v| v["spec"]["replicas"] = json!(0))
    );
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    let live = h.cluster.object(&deployment("v1-1-13")).unwrap();
    assert_eq!(live.spec().unwrap()["replicas"], json!(1));

    assert!(h.cluster.remove_object(&cluster_role("v1-1-13")));
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    assert!(h.cluster.object(&cluster_role("v1-1-13")).is_some());

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::UpToDate);
}

#[tokio::test]
async fn test_delete_waits_for_compositions() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    h.cluster.add_instance(
        &gvr("v1-1-13"),
        "FireworksApp",
        "demo",
        "fireworks-1",
        Some("v1-1-13"),
        &["composition.krateo.io/finalizer"],
    );
    h.cluster.mark_definition_deleting(&nn);

    let err = reconcile(&h, &nn).await.unwrap_err();
    assert!(matches!(err, KubeError::CompositionsStillExist { count: 1, .. }));
    assert!(err.is_blocking() && err.is_retryable());

    let def = h.cluster.definition(&nn).expect("definition kept");
    assert!(def.finalizers_list().contains(&CLEANUP_FINALIZER.to_string()));
    assert!(def.status.unwrap().error.unwrap().contains("still exist"));
    assert!(h.cluster.crd(CRD_NAME).is_some());
    assert!(h.cluster.object(&deployment("v1-1-13")).is_some());

    h.cluster.release_instance(&gvr("v1-1-13"), "demo", "fireworks-1");
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Deleted);

    assert!(h.cluster.definition(&nn).is_none());
    assert!(h.cluster.crd(CRD_NAME).is_none());
    assert!(h.cluster.objects().is_empty());
}

#[tokio::test]
async fn test_delete_keeps_crd_served_by_sibling() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let first = install(&h, "fireworksapp", "1.1.13");
    let second = install(&h, "fireworksapp-copy", "1.1.13");
    reconcile(&h, &first).await.unwrap();
    reconcile(&h, &second).await.unwrap();

    h.cluster.mark_definition_deleting(&first);
    assert_eq!(reconcile(&h, &first).await.unwrap(), Outcome::Deleted);
    assert!(h.cluster.definition(&first).is_none());
    assert!(h.cluster.crd(CRD_NAME).is_some());
    assert_eq!(h.cluster.operation_counts().crd_deletes, 0);
    assert_eq!(h.cluster.operation_counts().object_deletes, 0);
    assert!(h.cluster.object(&deployment("v1-1-13")).is_some());
    assert_eq!(reconcile(&h, &second).await.unwrap(), Outcome::UpToDate);

    h.cluster.mark_definition_deleting(&second);
    assert_eq!(reconcile(&h, &second).await.unwrap(), Outcome::Deleted);
    assert!(h.cluster.crd(CRD_NAME).is_none());
    assert!(h.cluster.objects().is_empty());
}

#[tokio::test]
async fn test_delete_removes_own_version_next_to_sibling() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14"]);
    let first = install(&h, "fireworksapp", "1.1.13");
    let second = install(&h, "fireworksapp-next", "1.1.14");
    reconcile(&h, &first).await.unwrap();
    reconcile(&h, &second).await.unwrap();
    assert!(h.cluster.object(&deployment("v1-1-14")).is_some());

    h.cluster.mark_definition_deleting(&first);
    assert_eq!(reconcile(&h, &first).await.unwrap(), Outcome::Deleted);
    assert!(h.cluster.object(&deployment("v1-1-13")).is_none());
    assert!(h.cluster.object(&cluster_role("v1-1-13")).is_none());
    assert!(h.cluster.object(&deployment("v1-1-14")).is_some());
    assert!(h.cluster.crd(CRD_NAME).is_some());
}

#[tokio::test]
async fn test_update_survives_crd_conflicts() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    h.cluster.inject_crd_conflicts(2);
    upgrade(&h, &nn, "1.1.14");
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);

    let crd = h.cluster.crd(CRD_NAME).unwrap();
    assert_eq!(version_names(&crd), vec!["v1-1-13", "v1-1-14", "vacuum"]);
}

#[tokio::test]
async fn test_partial_rbac_is_recorded_not_fatal() {
    let h = TestHarness::with_renderer(
        &["1.1.13"],
        StaticRenderer::with_rbac_gaps(&["fireworks-app/templates/dynamic.yaml"]),
    );
    let nn = install(&h, "fireworksapp", "1.1.13");

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Created);
    assert!(h.cluster.object(&cluster_role("v1-1-13")).is_some());

    let error = h.cluster.definition(&nn).unwrap().status.unwrap().error;
    assert!(error.unwrap().contains("fireworks-app/templates/dynamic.yaml"));
}

#[tokio::test]
async fn test_unresolvable_chart_is_reported() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let nn = install(&h, "fireworksapp", "9.9.9");

    let err = reconcile(&h, &nn).await.unwrap_err();
    assert!(!err.is_retryable());

    let status = h.cluster.definition(&nn).unwrap().status.unwrap();
    assert!(status.error.as_deref().unwrap().contains("Chart not found"));
    assert_eq!(status.ready_condition().unwrap().reason, "ReconcileError");
    assert!(h.cluster.crd(CRD_NAME).is_none());
}

#[tokio::test]
async fn test_chart_credentials_come_from_secret() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    h.cluster.set_secret(NAMESPACE, "chart-auth", "password", "s3cret");

    let mut def = fireworks_definition("fireworksapp", NAMESPACE, "1.1.13");
    def.spec.chart.credentials = Some(ChartCredentials {
        username: "krateo".to_string(),
        password_ref: SecretKeyRef {
            name: "chart-auth".to_string(),
            namespace: NAMESPACE.to_string(),
            key: "password".to_string(),
        },
    });
    let nn = def.namespaced_name();
    h.cluster.add_definition(def);

    reconcile(&h, &nn).await.unwrap();
    let seen = h.resolver.seen_credentials();
    let creds = seen[0].as_ref().expect("credentials passed");
    assert_eq!(creds.username, "krateo");
    assert_eq!(creds.password, "s3cret");
}

#[tokio::test]
async fn test_status_schema_change_is_not_current() {
    let h = TestHarness::fireworks(&["1.1.13"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    assert!(h.cluster.tamper_crd(CRD_NAME, |crd| {
        for version in &mut crd.spec.versions {
            let props = version
                .schema
                .as_mut()
                .and_then(|s| s.open_api_v3_schema.as_mut())
                .and_then(|s| s.properties.as_mut());
            if let Some(props) = props {
                props.insert(
                    "status".to_string(),
                    JSONSchemaProps {
                        type_: Some("object".to_string()),
                        ..Default::default()
                    },
                );
            }
        }
    }));

    let def = h.cluster.definition(&nn).unwrap();
    let observation = h.reconciler.observe_definition(&def).await.unwrap();
    assert!(observation.exists && !observation.up_to_date);

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    let def = h.cluster.definition(&nn).unwrap();
    assert!(h.reconciler.observe_definition(&def).await.unwrap().up_to_date);
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::UpToDate);
}

#[tokio::test]
async fn test_failed_migration_is_retried() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    upgrade(&h, &nn, "1.1.14");
    h.cluster.inject_delete_failures(1);
    let err = reconcile(&h, &nn).await.unwrap_err();
    assert!(matches!(err, KubeError::Timeout(_)));

    let status = h.cluster.definition(&nn).unwrap().status.unwrap();
    assert_eq!(status.api_version.as_deref(), Some("composition.krateo.io/v1-1-13"));
    assert_eq!(status.ready_condition().unwrap().reason, "ReconcileError");
    assert!(status.error.as_deref().unwrap().contains("delete"));
    assert!(h.cluster.object(&deployment("v1-1-13")).is_some());

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    assert!(h.cluster.object(&deployment("v1-1-13")).is_none());
    assert!(h.cluster.object(&cluster_role("v1-1-13")).is_none());
    assert!(h.cluster.object(&deployment("v1-1-14")).is_some());

    let status = h.cluster.definition(&nn).unwrap().status.unwrap();
    assert_eq!(status.api_version.as_deref(), Some("composition.krateo.io/v1-1-14"));
    assert!(status.is_available());
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::UpToDate);
}

#[tokio::test]
async fn test_failed_install_keeps_chart_snapshot() {
    let h = TestHarness::fireworks(&["1.1.13", "1.1.14", "1.1.15"]);
    let nn = install(&h, "fireworksapp", "1.1.13");
    reconcile(&h, &nn).await.unwrap();

    upgrade(&h, &nn, "1.1.14");
    h.cluster.inject_apply_failures(1);
    assert!(reconcile(&h, &nn).await.is_err());
    let crd = h.cluster.crd(CRD_NAME).unwrap();
    assert!(version_names(&crd).contains(&"v1-1-14"));

    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    let def = h.cluster.definition(&nn).unwrap();
    let v14 = def
        .status
        .as_ref()
        .unwrap()
        .version_info()
        .iter()
        .find(|v| v.version == "v1-1-14")
        .cloned()
        .unwrap();
    assert_eq!(v14.chart.map(|c| c.version), Some("1.1.14".to_string()));

    upgrade(&h, &nn, "1.1.15");
    assert_eq!(reconcile(&h, &nn).await.unwrap(), Outcome::Updated);
    assert!(h.cluster.object(&deployment("v1-1-14")).is_none());
    assert!(h.cluster.object(&deployment("v1-1-15")).is_some());
}
