//! Compositor Engine - Workload rendering
//!
//! Renders the dynamic controller that serves one API version of a
//! composition resource:
//! - Embedded MiniJinja templates for the workload objects
//! - RBAC rules inferred from the chart's own templates
//! - Templates whose resources cannot be determined are reported, not fatal

pub mod error;
pub mod filters;
pub mod rbac;
pub mod renderer;

pub use error::{EngineError, Result};
pub use rbac::{PolicyRule, RbacInference, infer_rules};
pub use renderer::{DEFAULT_CONTROLLER_IMAGE, TemplateRenderer, workload_name};
