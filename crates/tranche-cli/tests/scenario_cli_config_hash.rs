use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;

fn config_hash_line(out: &[u8]) -> String {
    String::from_utf8_lossy(out)
        .lines()
        .find(|l| l.starts_with("config_hash="))
        .map(|l| l.to_string())
        .unwrap_or_default()
}

#[test]
fn config_hash_merges_layers_in_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("base.yaml");
    let site = dir.path().join("site.yaml");
    fs::write(&base, "dedupe:\n  ttl_minutes: 60\nsaga:\n  step_timeout_ms: 5000\n")?;
    fs::write(&site, "dedupe:\n  ttl_minutes: 15\n")?;

    Command::cargo_bin("tranche")?
        .current_dir(dir.path())
        .args(["config-hash"])
        .arg(&base)
        .arg(&site)
        .assert()
        .success()
        .stdout(predicate::str::contains("config_hash="))
        .stdout(predicate::str::contains(r#""ttl_minutes":15"#))
        .stdout(predicate::str::contains(r#""step_timeout_ms":5000"#));
    Ok(())
}

#[test]
fn config_hash_is_stable_and_order_sensitive() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a.yaml");
    let b = dir.path().join("b.yaml");
    fs::write(&a, "dedupe:\n  ttl_minutes: 60\n")?;
    fs::write(&b, "dedupe:\n  ttl_minutes: 15\n")?;

    let run = |first: &std::path::Path, second: &std::path::Path| -> anyhow::Result<String> {
        let out = Command::cargo_bin("tranche")?
            .current_dir(dir.path())
            .arg("config-hash")
            .arg(first)
            .arg(second)
            .output()?;
        assert!(out.status.success());
        Ok(config_hash_line(&out.stdout))
    };

    let ab1 = run(&a, &b)?;
    let ab2 = run(&a, &b)?;
    let ba = run(&b, &a)?;
    assert!(!ab1.is_empty());
    assert_eq!(ab1, ab2);
    assert_ne!(ab1, ba);
    Ok(())
}

#[test]
fn config_with_secret_literal_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = dir.path().join("bad.yaml");
    fs::write(&bad, "store:\n  database_url_env: \"postgres://u:p@db/x\"\n")?;

    Command::cargo_bin("tranche")?
        .current_dir(dir.path())
        .arg("config-hash")
        .arg(&bad)
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("p@db").not());
    Ok(())
}
