//! Labels shared by the controller and the workloads it deploys

/// API version an instance was written under
pub const VERSION_LABEL: &str = "krateo.io/composition-version";

/// Definition a workload object belongs to
pub const DEFINITION_LABEL: &str = "krateo.io/composition-definition";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY_VALUE: &str = "compositor";

/// Label selector matching objects managed by this controller
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}
