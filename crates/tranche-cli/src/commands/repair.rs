//! `tranche repair scan|apply`.

use anyhow::{Context, Result};
use tranche_engine::OrderScope;
use tranche_reconcile::{Issue, IssueId, RepairMethod, RepairOutcome};

use super::{refusal, CliContext};

pub async fn scan(config_paths: &[String], scope: OrderScope, json: bool) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let report = engine.run_repair_scan(scope).await.map_err(refusal)?;

    if json {
        let out = serde_json::to_string_pretty(&report).context("serialize scan report")?;
        println!("{}", out);
        return Ok(());
    }

    println!(
        "orders_scanned={} issues={} auto_correctable={}",
        report.orders_scanned,
        report.issues.len(),
        report.auto_correctable().count()
    );
    for issue in &report.issues {
        println!("{}", issue_line(issue));
    }
    Ok(())
}

pub async fn apply_one(config_paths: &[String], issue: IssueId, method: RepairMethod) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let outcome = engine.apply_repair(issue, method).await.map_err(refusal)?;
    println!("{}", outcome_line(&outcome));
    Ok(())
}

/// Scan `scope`, then apply every auto-correctable issue with the default
/// method. Keeps going past failures and reports them at the end.
pub async fn apply_all(config_paths: &[String], scope: OrderScope) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let report = engine.run_repair_scan(scope).await.map_err(refusal)?;

    let mut applied = 0usize;
    let mut failed = 0usize;
    for issue in report.auto_correctable() {
        match engine.apply_repair(issue.id, RepairMethod::Auto).await {
            Ok(outcome) => {
                if outcome.changed_anything() {
                    applied += 1;
                }
                println!("{}", outcome_line(&outcome));
            }
            Err(e) => {
                failed += 1;
                println!(
                    "issue={} outcome={} error=\"{}\"",
                    issue.id,
                    e.outcome_code(),
                    e
                );
            }
        }
    }

    println!(
        "orders_scanned={} issues={} applied={} failed={}",
        report.orders_scanned,
        report.issues.len(),
        applied,
        failed
    );
    if failed > 0 {
        anyhow::bail!("REPAIR_INCOMPLETE: {failed} repair(s) failed");
    }
    Ok(())
}

fn issue_line(issue: &Issue) -> String {
    let ratio = issue
        .ratio_bps
        .map(|r| r.to_string())
        .unwrap_or_else(|| "".to_string());
    format!(
        "issue={} total_minor={} allocated_minor={} ratio_bps={} auto={} detail=\"{}\"",
        issue.id,
        issue.order_total.raw(),
        issue.allocated_total.raw(),
        ratio,
        issue.auto_correctable,
        issue.detail
    )
}

fn outcome_line(outcome: &RepairOutcome) -> String {
    match outcome {
        RepairOutcome::Applied { issue, plan } => format!(
            "issue={} outcome=applied action={} rows={}",
            issue,
            plan.action(),
            plan.write_count()
        ),
        RepairOutcome::AlreadyConsistent { issue } => {
            format!("issue={} outcome=already_consistent", issue)
        }
        RepairOutcome::NotApplicable { issue, current } => {
            let kinds: Vec<&str> = current.iter().map(|k| k.as_str()).collect();
            format!(
                "issue={} outcome=not_applicable current={}",
                issue,
                kinds.join(",")
            )
        }
    }
}
