use std::fs;

use predicates::prelude::*;

const TOC: &str = r#"[
  {"index": 1, "key": "c2", "title": "Two"},
  {"index": 0, "key": "c1", "title": "One"},
  {"index": 2, "key": "v1", "title": "Volume", "isVolume": true}
]"#;

fn write_toc(dir: &std::path::Path) -> anyhow::Result<String> {
    let path = dir.join("toc.json");
    fs::write(&path, TOC)?;
    Ok(path.display().to_string())
}

#[test]
fn fingerprint_prints_sixteen_hex_chars() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let toc = write_toc(temp.path())?;

    let first = assert_cmd::cargo::cargo_bin_cmd!("booksync")
        .args(["fingerprint", "--toc", &toc])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^[0-9a-f]{16}\n$")?)
        .get_output()
        .stdout
        .clone();

    let reordered = temp.path().join("reordered.json");
    fs::write(
        &reordered,
        r#"[{"index": 0, "key": "c1"}, {"index": 2, "key": "v1"}, {"index": 1, "key": "c2"}]"#,
    )?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    let second = cmd
        .args(["fingerprint", "--toc", &reordered.display().to_string()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn plan_without_cache_or_output_fetches_everything() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let toc = write_toc(temp.path())?;
    let cache = temp.path().join("cache").display().to_string();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    cmd.args(["plan", "--toc", &toc, "--cache", &cache])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""source": "fresh""#))
        .stdout(predicate::str::contains(r#""c1""#));
    Ok(())
}

#[test]
fn cache_status_fails_without_a_cache() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let dir = temp.path().join("nothing").display().to_string();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    cmd.args(["cache", "status", "--dir", &dir])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no chapter cache"));
    Ok(())
}

#[test]
fn inspect_rejects_files_without_sync_state() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let epub = temp.path().join("book.epub");
    fs::write(&epub, b"not an epub")?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    cmd.args(["inspect", "--epub", &epub.display().to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no sync state found"));
    Ok(())
}

#[test]
fn invalid_namespace_is_reported() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let toc = write_toc(temp.path())?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    cmd.args(["--namespace", "Bad NS", "plan", "--toc", &toc, "--cache", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid marker namespace"));
    Ok(())
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let toc = write_toc(temp.path())?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("booksync");
    cmd.env("RUST_LOG", "debug")
        .args(["fingerprint", "--toc", &toc])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
