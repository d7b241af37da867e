//! Ledger commands: order create, remaining, list, submit, confirm, cancel,
//! session end, dedupe purge.

use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use tranche_db::PgStore;
use tranche_engine::SubmitRequest;
use tranche_money::Amount;
use tranche_schemas::{DeliveryLine, InstallmentId, OrderId};

use super::{refusal, CliContext};

pub struct SubmitArgs {
    pub order_id: i64,
    pub amount: Amount,
    pub actor: String,
    pub session: String,
    pub memo: Option<String>,
    pub lines_file: Option<String>,
}

pub async fn order_create(config_paths: &[String], total: Amount) -> Result<()> {
    if total.is_negative() {
        anyhow::bail!("order total must be >= 0, got {}", total.raw());
    }
    let ctx = CliContext::load(config_paths)?;
    let store = PgStore::new(ctx.connect().await?);
    let order = store.create_order(total, Utc::now()).await?;
    println!("order_id={}", order.order_id);
    println!("total_minor={}", order.total_amount.raw());
    Ok(())
}

pub async fn remaining(
    config_paths: &[String],
    order_id: i64,
    amount: Amount,
    exclude: Option<i64>,
) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let r = engine
        .get_remaining(OrderId(order_id), amount, exclude.map(InstallmentId))
        .await
        .map_err(refusal)?;
    println!("order_id={}", order_id);
    if let Some(id) = exclude {
        println!("excluded_installment_id={id}");
    }
    println!("order_total_minor={}", r.order_total.raw());
    println!("allocated_total_minor={}", r.allocated_total.raw());
    println!("candidate_minor={}", r.candidate_amount.raw());
    println!("projected_total_minor={}", r.projected_total.raw());
    println!("remaining_minor={}", r.remaining_amount.raw());
    println!("is_exceeding={}", r.is_exceeding);
    println!("exceeding_minor={}", r.exceeding_amount.raw());
    Ok(())
}

pub async fn list(config_paths: &[String], order_id: i64) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let entries = engine
        .list_installments(OrderId(order_id))
        .await
        .map_err(refusal)?;
    println!("order_id={} installments={}", order_id, entries.len());
    for i in entries {
        println!(
            "installment_id={} seq={} amount_minor={} status={} actor={}",
            i.installment_id,
            i.sequence_no,
            i.amount.raw(),
            i.status,
            i.actor_id
        );
    }
    Ok(())
}

pub async fn submit(config_paths: &[String], args: SubmitArgs) -> Result<()> {
    let lines = match &args.lines_file {
        Some(path) => load_lines(path)?,
        None => Vec::new(),
    };

    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let accepted = engine
        .submit_installment(SubmitRequest {
            order_id: OrderId(args.order_id),
            amount: args.amount,
            actor_id: args.actor,
            session_id: args.session,
            memo: args.memo,
            lines,
        })
        .await
        .map_err(refusal)?;

    println!("accepted=true");
    println!("installment_id={}", accepted.installment_id);
    println!("sequence_no={}", accepted.sequence_no);
    println!("remaining_minor={}", accepted.remaining.raw());
    Ok(())
}

pub async fn confirm(config_paths: &[String], installment_id: i64) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let c = engine
        .confirm_installment(InstallmentId(installment_id))
        .await
        .map_err(refusal)?;
    println!(
        "confirmed=true installment_id={} confirmed_at_utc={} remaining_minor={}",
        c.installment_id,
        c.confirmed_at_utc.to_rfc3339(),
        c.remaining.raw()
    );
    Ok(())
}

pub async fn cancel(config_paths: &[String], installment_id: i64, actor: &str) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let c = engine
        .cancel_installment(InstallmentId(installment_id), actor)
        .await
        .map_err(refusal)?;
    println!(
        "cancelled=true installment_id={} cancelled_at_utc={} reversed_movements={}",
        c.installment_id,
        c.cancelled_at_utc.to_rfc3339(),
        c.reversed_movements
    );
    Ok(())
}

pub async fn session_end(config_paths: &[String], session: &str) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let n = engine.end_session(session).await.map_err(refusal)?;
    println!("session_ended=true session={} fingerprints_invalidated={}", session, n);
    Ok(())
}

pub async fn dedupe_purge(config_paths: &[String]) -> Result<()> {
    let ctx = CliContext::load(config_paths)?;
    let engine = ctx.engine().await?;
    let n = engine.purge_expired_fingerprints().await.map_err(refusal)?;
    println!("purged={}", n);
    Ok(())
}

/// JSON array of delivery lines. A UTF-8 BOM is tolerated.
fn load_lines(path: &str) -> Result<Vec<DeliveryLine>> {
    let bytes = fs::read(path).with_context(|| format!("read lines-file failed: {}", path))?;
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&bytes);
    let raw = std::str::from_utf8(bytes).context("lines-file must be UTF-8 text")?;
    serde_json::from_str(raw.trim()).context("lines-file must be a JSON array of delivery lines")
}
