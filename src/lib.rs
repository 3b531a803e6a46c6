// src/lib.rs

pub mod bus;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod plugin;
pub mod store;
pub mod template;
pub mod traversal;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::load_or_default;
use crate::dag::{BuiltGraph, NodeKind, NodePlan};
use crate::engine::{CancellationController, Engine, StackRequest, StackStatusView};
use crate::plugin::PluginRegistry;
use crate::store::InMemoryStore;
use crate::template::{load_environment, load_template, Environment};
use crate::types::{CancelMode, StackStatus};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config, template and environment loading
/// - an in-memory store and a single engine with the built-in types
/// - create, then the optional update / delete of one stack
/// - Ctrl-C handling (cancels the running action)
pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_or_default(args.config.as_deref().map(Path::new))?;
    let template = load_template(&args.template)?;
    let environment = match &args.environment {
        Some(path) => load_environment(path)?,
        None => Environment::default(),
    };

    let engine = Engine::start(
        config,
        Arc::new(InMemoryStore::new()),
        PluginRegistry::with_builtins(),
    );
    let stack = args.stack.as_str();
    let request = StackRequest::new(template)
        .with_environment(environment.clone())
        .with_rollback(args.rollback);

    if args.dry_run {
        let built = engine.preview(stack, &request).await?;
        print_dry_run(stack, &built);
        engine.shutdown().await?;
        return Ok(());
    }

    // Ctrl-C -> cancel whatever the stack is doing.
    {
        let ctx = engine.context().clone();
        let stack = stack.to_string();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!(%stack, "interrupted; cancelling stack action");
            if let Err(err) = CancellationController::new(ctx)
                .cancel(&stack, CancelMode::NoRollback)
                .await
            {
                warn!(%stack, error = %err, "cancel failed");
            }
        });
    }

    engine.create_stack(stack, request).await?;
    let mut report = engine.wait_until_settled(stack).await?;
    info!(%stack, status = %report.status, "create finished");

    if let Some(path) = &args.update_template {
        if report.status == StackStatus::Complete {
            let update = StackRequest::new(load_template(path)?)
                .with_environment(environment)
                .with_rollback(args.rollback);
            engine.update_stack(stack, update).await?;
            report = engine.wait_until_settled(stack).await?;
            info!(%stack, status = %report.status, "update finished");
        } else {
            warn!(%stack, "skipping update of a stack that did not complete");
        }
    }

    if args.delete {
        engine.delete_stack(stack).await?;
        report = engine.wait_until_settled(stack).await?;
        info!(%stack, status = %report.status, "delete finished");
    }

    print_report(&report);
    engine.shutdown().await?;

    if report.status == StackStatus::Failed {
        bail!("stack {stack} {}: {}", report.action, report.status_reason);
    }
    Ok(())
}

/// Print the graph an action would traverse and how it relates to what is
/// deployed.
fn print_dry_run(stack: &str, built: &BuiltGraph) {
    println!("convergent dry-run: stack {stack}");
    println!();

    let order = built.graph.topological_order().unwrap_or_default();
    println!("nodes ({}):", order.len());
    for key in order.iter() {
        let detail = match built.graph.plan(key) {
            Some(NodePlan::Update(plan)) => {
                let mut detail = format!("{} ({:?})", plan.spec.resource_type, plan.change);
                if let Some(policy) = plan.replace {
                    detail.push_str(&format!(" replace={policy:?}"));
                }
                detail
            }
            Some(NodePlan::Cleanup(plan)) if plan.delete_current => "delete".to_string(),
            Some(NodePlan::Cleanup(_)) => "delete superseded generations".to_string(),
            None => String::new(),
        };
        println!("  - {key}: {detail}");
        let deps: Vec<String> = built
            .graph
            .dependencies_of(key)
            .map(|d| d.to_string())
            .collect();
        if !deps.is_empty() {
            println!("      after: {deps:?}");
        }
    }
    println!();

    let diff = &built.diff;
    println!("diff:");
    println!("  added:     {:?}", diff.added);
    println!("  changed:   {:?}", diff.changed);
    println!("  replaced:  {:?}", diff.replaced);
    println!("  unchanged: {:?}", diff.unchanged);
    println!("  cleanup:   {:?}", diff.cleanup);

    let cleanups = built
        .graph
        .nodes()
        .filter(|k| k.kind == NodeKind::Cleanup)
        .count();
    debug!(cleanups, "dry-run complete (nothing converged)");
}

fn print_report(report: &StackStatusView) {
    println!(
        "stack {}: {} {} ({})",
        report.stack_id, report.action, report.status, report.status_reason
    );
    for r in report.resources.iter() {
        println!(
            "  {:<20} {:<20} gen={:<3} {:<7} {:<12} {}{}",
            r.name,
            r.resource_type,
            r.generation,
            r.action.to_string(),
            r.status.to_string(),
            r.physical_id.as_deref().unwrap_or("-"),
            if r.status_reason.is_empty() {
                String::new()
            } else {
                format!("  ({})", r.status_reason)
            }
        );
    }
}
