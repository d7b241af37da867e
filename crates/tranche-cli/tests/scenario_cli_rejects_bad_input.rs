use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

/// Run from an empty directory so no `.env.local` is picked up.
fn tranche(dir: &tempfile::TempDir) -> anyhow::Result<Command> {
    let mut cmd = Command::cargo_bin("tranche")?;
    cmd.current_dir(dir.path()).env_remove("TRANCHE_DATABASE_URL");
    Ok(cmd)
}

#[test]
fn ledger_commands_need_database_url() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tranche(&dir)?
        .args(["remaining", "--order-id", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SECRETS_MISSING"))
        .stderr(predicate::str::contains("TRANCHE_DATABASE_URL"));
    Ok(())
}

#[test]
fn malformed_amount_is_rejected_before_connecting() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tranche(&dir)?
        .args([
            "submit", "--order-id", "1", "--amount", "12,50", "--actor", "a", "--session", "s",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--amount"))
        .stderr(predicate::str::contains("SECRETS_MISSING").not());
    Ok(())
}

#[test]
fn remaining_accepts_an_excluded_installment() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // Parsed fine; the run only stops at the missing database URL.
    tranche(&dir)?
        .args(["remaining", "--order-id", "1", "--amount", "50.00", "--exclude-installment-id", "7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SECRETS_MISSING"));

    tranche(&dir)?
        .args(["remaining", "--order-id", "1", "--exclude-installment-id", "seven"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--exclude-installment-id"))
        .stderr(predicate::str::contains("SECRETS_MISSING").not());

    tranche(&dir)?
        .args(["remaining", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--exclude-installment-id"));
    Ok(())
}

#[test]
fn repair_apply_needs_an_issue_or_auto_all() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tranche(&dir)?
        .args(["repair", "apply"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--issue"));

    tranche(&dir)?
        .args(["repair", "apply", "--issue", "42:not_a_kind"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid issue id"));

    tranche(&dir)?
        .args(["repair", "apply", "--issue", "42:sequence_gap", "--method", "guess"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown repair method"));
    Ok(())
}

#[test]
fn help_lists_administrative_commands() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tranche(&dir)?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("audit"));
    Ok(())
}
