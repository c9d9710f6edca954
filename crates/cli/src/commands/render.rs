//! Print the agent config last deployed to an endpoint

use super::Context;
use anyhow::{anyhow, Result};
use clap::Args;
use skein_orchestrator::{deploy, StateStore};

#[derive(Args)]
pub struct RenderArgs {
    /// Endpoint as `<network>/<endpoint>`
    pub endpoint: String,
}

fn split_endpoint(target: &str) -> Result<(&str, &str)> {
    match target.split_once('/') {
        Some((network, endpoint)) if !network.is_empty() && !endpoint.is_empty() => {
            Ok((network, endpoint))
        }
        _ => Err(anyhow!("expected <network>/<endpoint>, got {:?}", target)),
    }
}

pub async fn execute(args: RenderArgs, ctx: &Context) -> Result<()> {
    let (network, endpoint) = split_endpoint(&args.endpoint)?;
    let state = StateStore::new(ctx.open_db()?);
    let config = deploy::deployed_config(&state, network, endpoint)?;
    print!("{}", config);
    Ok(())
}
