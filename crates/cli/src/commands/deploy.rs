//! Apply, plan and destroy

use super::Context;
use crate::output::{print_list, print_success, OutputFormat, TableDisplay};
use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use skein_orchestrator::{Change, Declaration, Deployment, Report, ResourceChange};
use skein_provider::ssh::SshConnector;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args)]
pub struct DeclarationArgs {
    /// Declaration file
    #[arg(short, long, default_value = "skein.toml")]
    pub file: PathBuf,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Declaration file; needed to reach a remote allocator
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Do not ask for confirmation
    #[arg(long)]
    pub yes: bool,
}

impl TableDisplay for ResourceChange {
    fn headers() -> Vec<&'static str> {
        vec!["RESOURCE", "KIND", "CHANGE"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.urn.clone(), self.kind.clone(), self.change.to_string()]
    }
}

fn deployment(ctx: &Context, declaration: Option<&Declaration>) -> Result<Deployment> {
    let db = ctx.open_db()?;
    tracing::debug!(store = %ctx.config.store_path.display(), "opened state database");
    Ok(Deployment::from_config(
        ctx.config.clone(),
        db,
        Arc::new(SshConnector::new()),
        declaration,
    )?)
}

/// One-line tally of a report
pub fn summary(report: &Report) -> String {
    let create = report.count(|c| *c == Change::Create);
    let replace = report.count(|c| matches!(c, Change::Replace { .. }));
    let refresh = report.count(|c| matches!(c, Change::Refresh { .. }));
    let destroy = report.count(|c| *c == Change::Destroy);
    let pending = report.count(|c| *c == Change::Pending);
    let unchanged = report.count(|c| *c == Change::NoOp);

    let mut parts = vec![
        format!("{} create", create).green().to_string(),
        format!("{} replace", replace).yellow().to_string(),
        format!("{} refresh", refresh).cyan().to_string(),
        format!("{} destroy", destroy).red().to_string(),
    ];
    if pending > 0 {
        parts.push(format!("{} pending", pending).dimmed().to_string());
    }
    parts.push(format!("{} unchanged", unchanged));
    parts.join(", ")
}

fn print_report(report: &Report, format: OutputFormat, hide_noop: bool) -> Result<()> {
    match format {
        OutputFormat::Table => {
            let changes: Vec<ResourceChange> = report
                .changes
                .iter()
                .filter(|c| !hide_noop || c.change != Change::NoOp)
                .cloned()
                .collect();
            if !changes.is_empty() {
                print_list(&changes, format)?;
            }
            println!("{}", summary(report));
        }
        _ => print_list(&report.changes, format)?,
    }
    Ok(())
}

pub async fn apply(args: DeclarationArgs, ctx: &Context) -> Result<()> {
    let declaration = Declaration::load(&args.file)?;
    let report = deployment(ctx, Some(&declaration))?.apply(&declaration).await?;
    print_report(&report, ctx.format, true)?;
    if matches!(ctx.format, OutputFormat::Table) {
        print_success("Apply complete");
    }
    Ok(())
}

pub async fn plan(args: DeclarationArgs, ctx: &Context) -> Result<()> {
    let declaration = Declaration::load(&args.file)?;
    let report = deployment(ctx, Some(&declaration))?.plan(&declaration).await?;
    print_report(&report, ctx.format, false)
}

pub async fn destroy(args: DestroyArgs, ctx: &Context) -> Result<()> {
    if !args.yes {
        bail!("destroy tears down every recorded resource; pass --yes to proceed");
    }
    let declaration = args.file.as_deref().map(Declaration::load).transpose()?;
    let report = deployment(ctx, declaration.as_ref())?.destroy().await?;
    print_report(&report, ctx.format, false)?;
    if matches!(ctx.format, OutputFormat::Table) {
        print_success("Destroy complete");
    }
    Ok(())
}
