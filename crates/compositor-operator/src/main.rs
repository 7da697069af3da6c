//! Compositor operator - turns Helm charts into versioned Kubernetes APIs

use clap::Parser;
use compositor_core::CompositionDefinition;
use kube::{Client, CustomResourceExt};
use miette::Result;

mod config;
mod controller;
mod error;
mod telemetry;

use config::OperatorConfig;
use error::OperatorError;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    let config = OperatorConfig::parse();

    if config.print_crd {
        let crd =
            serde_yaml::to_string(&CompositionDefinition::crd()).map_err(OperatorError::from)?;
        println!("{crd}");
        return Ok(());
    }

    telemetry::init(&config.log_level, config.log_format)?;

    let client = Client::try_default().await.map_err(OperatorError::from)?;
    controller::run(client, config).await?;
    Ok(())
}
