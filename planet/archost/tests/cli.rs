use assert_cmd::cargo::CommandCargoExt;
use std::fs;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const DEFS: &str = r#"{
  "schemas": [
    {"data_model_uri": "planet/person", "schema_name": "Person",
     "attrs": [{"name": "name", "value_type": "text"}]},
    {"data_model_uri": "planet/employee", "schema_name": "Employee",
     "attrs": [{"name": "age", "value_type": "int"}],
     "inherits_from": ["planet/person"]}
  ]
}"#;

#[test]
fn resolve_prints_flattened_schemas() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let defs_path = temp.path().join("defs.json");
    fs::write(&defs_path, DEFS)?;

    let output = Command::cargo_bin("archost")?
        .arg("resolve")
        .arg("--file")
        .arg(&defs_path)
        .output()?;
    assert!(output.status.success());

    let resolved: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let employee = &resolved["schemas"][1];
    assert_ne!(employee["schema_id"], 0);
    let names: Vec<&str> = employee["attrs"]
        .as_array()
        .ok_or("attrs missing")?
        .iter()
        .filter_map(|a| a["name"].as_str())
        .collect();
    assert_eq!(names, vec!["age", "name"]);
    Ok(())
}

#[test]
fn resolve_rejects_cycles() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let defs_path = temp.path().join("cycle.json");
    fs::write(
        &defs_path,
        r#"{"schemas": [
            {"data_model_uri": "a", "inherits_from": ["b"]},
            {"data_model_uri": "b", "inherits_from": ["a"]}
        ]}"#,
    )?;

    let output = Command::cargo_bin("archost")?
        .arg("resolve")
        .arg("--file")
        .arg(&defs_path)
        .output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cyclic"));
    Ok(())
}

#[test]
fn daemon_serves_pins() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let socket_path = temp.path().join("archost.sock");
    let defs_path = temp.path().join("defs.json");
    let docs_path = temp.path().join("docs.json");
    fs::write(&defs_path, DEFS)?;
    fs::write(&docs_path, r#"{"/doc/1": {"name": "Ada", "age": 36, "badge": 7}}"#)?;

    let mut daemon = Command::cargo_bin("archost")?
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .arg("daemon")
        .arg("--socket")
        .arg(&socket_path)
        .arg("--docs")
        .arg(&docs_path)
        .spawn()?;

    // Give the daemon a moment to bind the socket.
    thread::sleep(Duration::from_millis(750));

    let output = Command::cargo_bin("archost")?
        .arg("pin")
        .arg("--socket")
        .arg(&socket_path)
        .arg("--defs")
        .arg(&defs_path)
        .arg("--data-model")
        .arg("planet/employee")
        .arg("/doc/1")
        .output()?;

    let missing = Command::cargo_bin("archost")?
        .arg("pin")
        .arg("--socket")
        .arg(&socket_path)
        .arg("--defs")
        .arg(&defs_path)
        .arg("--data-model")
        .arg("planet/employee")
        .arg("/doc/404")
        .output()?;

    daemon.kill()?;
    let _ = daemon.wait();

    assert!(output.status.success());
    let state: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(state, serde_json::json!({"name": "Ada", "age": 36}));
    assert!(!missing.status.success());
    Ok(())
}
