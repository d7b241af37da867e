//! Scan and repair of drifted orders.
//!
//! A repair never trusts the scan that reported it: it takes the order lock,
//! re-reads, re-classifies and re-plans, then writes compare-and-set against
//! the values it just read. Applying the same repair twice is a no-op.

use serde_json::json;
use tranche_reconcile::{
    classify_order, plan_repair, Issue, IssueId, IssueKind, RepairMethod, RepairOutcome,
    RepairPlan, ScanReport,
};
use tranche_schemas::{Installment, Order};
use uuid::Uuid;

use crate::error::{plan_error, EngineError, EngineResult};
use crate::notify::Outcome;
use crate::service::InstallmentEngine;
use crate::store::{OrderScope, WriteOutcome};

impl InstallmentEngine {
    /// Classify every order in `scope`. Read-only.
    pub async fn run_repair_scan(&self, scope: OrderScope) -> EngineResult<ScanReport> {
        let ids = self.ledger.list_order_ids(scope).await?;
        let mut report = ScanReport::default();

        for order_id in ids {
            let order = match self.read_order(order_id).await {
                Ok(o) => o,
                // Deleted between listing and reading.
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let installments = self.read_installments(order_id).await?;
            report.orders_scanned += 1;
            report.issues.extend(classify_order(
                &order,
                &installments,
                self.settings.allocation.counting_policy,
                &self.settings.repair,
            ));
        }

        tracing::info!(
            orders_scanned = report.orders_scanned,
            issues = report.issues.len(),
            auto_correctable = report.auto_correctable().count(),
            "repair_scan_done"
        );
        Ok(report)
    }

    pub async fn apply_repair(
        &self,
        issue: IssueId,
        method: RepairMethod,
    ) -> EngineResult<RepairOutcome> {
        let result = self.apply_repair_inner(issue, method).await;
        self.report(Some(issue.order_id), result, |o| match o {
            RepairOutcome::Applied { plan, .. } => Outcome::info(
                "repair_applied",
                format!("{issue}: {} ({} row(s))", plan.action(), plan.write_count()),
            ),
            RepairOutcome::AlreadyConsistent { .. } => {
                Outcome::info("repair_already_consistent", issue.to_string())
            }
            RepairOutcome::NotApplicable { current, .. } => Outcome::info(
                "repair_not_applicable",
                format!(
                    "{issue}: current issues {}",
                    current.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",")
                ),
            ),
        })
    }

    async fn apply_repair_inner(
        &self,
        issue: IssueId,
        method: RepairMethod,
    ) -> EngineResult<RepairOutcome> {
        let order_id = issue.order_id;
        let _guard = self.locks.lock(order_id).await;

        let order = self.read_order(order_id).await?;
        let installments = self.read_installments(order_id).await?;
        let policy = self.settings.allocation.counting_policy;
        let current: Vec<Issue> =
            classify_order(&order, &installments, policy, &self.settings.repair);

        if current.is_empty() {
            tracing::info!(issue = %issue, "repair_already_consistent");
            return Ok(RepairOutcome::AlreadyConsistent { issue });
        }
        if !current.iter().any(|i| i.id.kind == issue.kind) {
            let kinds: Vec<IssueKind> = current.iter().map(|i| i.id.kind).collect();
            tracing::info!(issue = %issue, current = ?kinds, "repair_not_applicable");
            return Ok(RepairOutcome::NotApplicable {
                issue,
                current: kinds,
            });
        }

        let plan = plan_repair(
            issue.kind,
            method,
            &order,
            &installments,
            policy,
            &self.settings.repair,
        )
        .map_err(|e| plan_error(issue, e))?;

        let now = self.clock.now();
        let outcome = match &plan {
            RepairPlan::SetOrderTotal { from, to, .. } => {
                self.ledger.update_order_total(order_id, *from, *to, now).await?
            }
            RepairPlan::ScaleInstallments { changes, .. } => {
                self.ledger.apply_amount_changes(order_id, changes).await?
            }
            RepairPlan::CancelInstallments {
                installment_ids, ..
            } => {
                self.ledger
                    .cancel_installments(order_id, installment_ids, now)
                    .await?
            }
            RepairPlan::Renumber { changes, .. } => {
                self.ledger.apply_sequence_changes(order_id, changes).await?
            }
        };
        if outcome == WriteOutcome::Conflict {
            return Err(EngineError::RepairConflict {
                issue,
                reason: format!("{} compare-and-set failed; re-scan and retry", plan.action()),
            });
        }

        let delta = serde_json::to_string(&plan).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        tracing::info!(
            issue = %issue,
            method = method.as_str(),
            action = plan.action(),
            rows = plan.write_count(),
            delta = %delta,
            "repair_applied"
        );
        self.journal_repair(issue, method, &plan, &order, &installments);

        Ok(RepairOutcome::Applied { issue, plan })
    }

    /// Best effort: the repair is already committed, so a journal failure is
    /// logged, not returned.
    fn journal_repair(
        &self,
        issue: IssueId,
        method: RepairMethod,
        plan: &RepairPlan,
        order_before: &Order,
        installments_before: &[Installment],
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let payload = json!({
            "issue": issue.to_string(),
            "method": method.as_str(),
            "plan": plan,
            "order_before": order_before,
            "installments_before": installments_before,
        });
        let mut writer = journal.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.append(
            Uuid::new_v4(),
            self.clock.now(),
            "repair_applied",
            &issue.to_string(),
            payload,
        ) {
            tracing::error!(issue = %issue, error = %format!("{e:#}"), "repair_journal_failed");
        }
    }
}
