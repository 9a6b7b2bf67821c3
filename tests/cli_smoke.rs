use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let config = dir.path().join("config.toml");
        let db = dir.path().join("snail.db");
        let checkins = dir.path().join("checkins.json");
        fs::write(
            &config,
            format!(
                "mode = \"local\"\n\n[local]\ndb_path = {:?}\ncheckin_path = {:?}\n",
                db.display().to_string(),
                checkins.display().to_string()
            ),
        )?;
        Ok(Self { dir, config })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("snail").expect("binary");
        cmd.env_remove("RUST_LOG").arg("--config").arg(&self.config);
        cmd
    }

    /// Run with `--json` and return the envelope's `data`.
    fn json(&self, args: &[&str]) -> Result<Value> {
        let output = self.cmd().arg("--json").args(args).assert().success();
        let envelope: Value = serde_json::from_slice(&output.get_output().stdout)?;
        assert_eq!(envelope["schema_version"], "snail.v1");
        assert_eq!(envelope["status"], "success");
        Ok(envelope["data"].clone())
    }
}

#[test]
fn snail_help_works() {
    Command::cargo_bin("snail")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("optimistic sync"));
}

#[test]
fn subcommand_help_works() {
    for cmd in ["task", "tag", "project", "backup", "checkin", "streak"] {
        Command::cargo_bin("snail")
            .expect("binary")
            .arg(cmd)
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn task_lifecycle_through_the_cli() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let first = sandbox.json(&["task", "add", "Buy milk"])?;
    let second = sandbox.json(&["task", "add", "Walk dog", "--date", "2026-10-20"])?;
    let first_id = first["id"].as_str().expect("id").to_string();
    assert!(!first_id.starts_with("temp-"));
    assert_eq!(second["date"], "2026-10-20");

    let list = sandbox.json(&["task", "list"])?;
    let open = list["groups"][0]["open"].as_array().expect("open");
    assert_eq!(open[0]["title"], "Walk dog");
    assert_eq!(open[1]["title"], "Buy milk");

    let moved = sandbox.json(&["task", "move", "0", "1"])?;
    assert_eq!(moved["status"], "saved");
    let list = sandbox.json(&["task", "list"])?;
    assert_eq!(list["groups"][0]["open"][0]["title"], "Buy milk");

    let done = sandbox.json(&["task", "done", &first_id[..8]])?;
    assert_eq!(done["completed"], true);

    sandbox.json(&["task", "trash", &first_id])?;
    let trash = sandbox.json(&["task", "list", "--view", "trash"])?;
    assert_eq!(trash["tasks"].as_array().expect("tasks").len(), 1);

    let emptied = sandbox.json(&["task", "empty-trash"])?;
    assert_eq!(emptied["deleted"], 1);

    let history = sandbox.json(&["task", "history", second["id"].as_str().expect("id")])?;
    assert_eq!(history[0]["action"], "created");
    Ok(())
}

#[test]
fn tags_attach_and_count_usage() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let task = sandbox.json(&["task", "add", "Buy milk"])?;
    let tag = sandbox.json(&["tag", "add", "errands"])?;
    let task_id = task["id"].as_str().expect("id");
    let tag_id = tag["id"].as_str().expect("id");

    sandbox.json(&["tag", "attach", task_id, tag_id])?;
    let tags = sandbox.json(&["tag", "list", "--usage"])?;
    assert_eq!(tags[0]["name"], "errands");
    assert_eq!(tags[0]["usage"], 1);

    sandbox
        .cmd()
        .args(["tag", "add", "Errands"])
        .assert()
        .failure()
        .code(2);
    Ok(())
}

#[test]
fn projects_scope_tasks_and_tags() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let project = sandbox.json(&["project", "add", "Groceries"])?;
    let project_id = project["id"].as_str().expect("id");

    sandbox.json(&["task", "add", "Bread", "--project", project_id])?;
    sandbox.json(&["tag", "add", "aisle 3", "--project", project_id])?;
    let scoped = sandbox.json(&["tag", "list", "--project", project_id])?;
    assert_eq!(scoped.as_array().expect("tags").len(), 1);

    sandbox.json(&["project", "rm", project_id])?;
    let list = sandbox.json(&["task", "list"])?;
    assert_eq!(list["groups"][0]["project_id"], Value::Null);
    assert!(sandbox.json(&["tag", "list"])?.as_array().expect("tags").is_empty());
    Ok(())
}

#[test]
fn backup_export_and_import() -> Result<()> {
    let source = Sandbox::new()?;
    source.json(&["task", "add", "Buy milk"])?;
    source.json(&["tag", "add", "errands"])?;
    let archive = source.path().join("backup.tar.gz");
    let manifest = source.json(&["backup", "export", archive.to_str().expect("utf8")])?;
    assert_eq!(manifest["counts"]["tasks"], 1);
    assert_eq!(manifest["version"], 1);

    let target = Sandbox::new()?;
    let report = target.json(&[
        "backup",
        "import",
        archive.to_str().expect("utf8"),
        "--mode",
        "replace",
    ])?;
    assert_eq!(report["tasks"], 1);
    assert_eq!(report["mode"], "replace");
    let list = target.json(&["task", "list"])?;
    assert_eq!(list["groups"][0]["open"][0]["title"], "Buy milk");
    Ok(())
}

#[test]
fn checkins_build_a_streak() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let first = sandbox.json(&["checkin", "--date", "2026-10-16"])?;
    assert_eq!(first["added"], true);
    sandbox.json(&["checkin", "--date", "2026-10-17"])?;
    let again = sandbox.json(&["checkin", "--date", "2026-10-17"])?;
    assert_eq!(again["added"], false);

    let streak = sandbox.json(&["streak"])?;
    assert_eq!(streak["longest"], 2);
    assert_eq!(streak["total"], 2);
    Ok(())
}

#[test]
fn errors_use_the_json_envelope_and_exit_codes() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let output = sandbox
        .cmd()
        .args(["--json", "task", "done", "nope"])
        .assert()
        .failure()
        .code(2);
    let envelope: Value = serde_json::from_slice(&output.get_output().stdout)?;
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["command"], "task done");
    assert_eq!(envelope["error"]["kind"], "not_found");

    sandbox
        .cmd()
        .args(["checkin", "--date", "yesterday"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("YYYY-MM-DD"));
    Ok(())
}

#[test]
fn explicit_invalid_config_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let config = dir.path().join("config.toml");
    fs::write(&config, "[ordering]\nstep = 0.0\n")?;
    Command::cargo_bin("snail")?
        .arg("--config")
        .arg(&config)
        .arg("streak")
        .assert()
        .failure()
        .code(2)
        .stderr(contains("hint: fix config.toml"));
    Ok(())
}
