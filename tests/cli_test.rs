// ABOUTME: CLI tests running the object-replicator binary
// ABOUTME: Mapping validation and JSON-lines replication into a store snapshot

use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const MAPPING: &str = r#"
[[schema.entity]]
name = "Crm.Customer"
[[schema.entity.member]]
name = "Code"
type = "string"
[[schema.entity.member]]
name = "Name"
type = "string"

[[schema.entity]]
name = "Crm.Country"
[[schema.entity.member]]
name = "Code"
type = "string"

[[schema.association]]
name = "Crm.Customer_Country"
parent = "Crm.Customer"
child = "Crm.Country"

[main]
object_type = "Crm.Customer"
search_action = "find-create"

[[attribute]]
alias = "code"
member = "Code"
key = "object-key"

[[attribute]]
alias = "name"
member = "Name"

[[association]]
alias = "country"
association = "Crm.Customer_Country"
target_type = "Crm.Country"
member = "Code"
key = "association-key"

[[association_policy]]
association = "Crm.Customer_Country"
search_action = "find-create"
"#;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_object-replicator"))
}

fn objects_of(store: &Path, object_type: &str) -> Vec<serde_json::Value> {
    let contents = std::fs::read_to_string(store).unwrap();
    let snapshot: serde_json::Value = serde_json::from_str(&contents).unwrap();
    snapshot["objects"]
        .as_object()
        .unwrap()
        .values()
        .filter(|object| object["object_type"] == object_type)
        .cloned()
        .collect()
}

#[test]
fn test_validate_accepts_mapping() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("mapping.toml");
    std::fs::write(&config, MAPPING).unwrap();

    let output = binary()
        .args(["--log", "error", "validate", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("Mapping is valid"));
}

#[test]
fn test_validate_rejects_unknown_member() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("mapping.toml");
    std::fs::write(&config, MAPPING.replace("member = \"Name\"", "member = \"Missing\"")).unwrap();

    let output = binary()
        .args(["--log", "error", "validate", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Missing"), "stderr: {}", stderr);
}

#[test]
fn test_run_creates_then_updates_store() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("mapping.toml");
    let input = temp_dir.path().join("records.jsonl");
    let store = temp_dir.path().join("store.json");
    std::fs::write(&config, MAPPING).unwrap();
    std::fs::write(
        &input,
        concat!(
            r#"{"record": "1", "field": "code", "value": "A"}"#,
            "\n",
            r#"{"record": "1", "field": "name", "value": "foo"}"#,
            "\n",
            r#"{"record": "1", "field": "country", "value": "NL"}"#,
            "\n\n",
            r#"{"record": "2", "field": "code", "value": "a"}"#,
            "\n",
        ),
    )
    .unwrap();

    let run = |input: &Path| {
        binary()
            .args(["--log", "error", "run", "--config"])
            .arg(&config)
            .arg("--input")
            .arg(input)
            .arg("--store")
            .arg(&store)
            .output()
            .expect("Failed to execute command")
    };

    let output = run(input.as_path());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("\"created\": 1"));

    let customers = objects_of(&store, "Crm.Customer");
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0]["values"]["Name"]["value"], "foo");
    assert_eq!(objects_of(&store, "Crm.Country").len(), 1);

    let update = temp_dir.path().join("update.jsonl");
    std::fs::write(
        &update,
        concat!(
            r#"{"record": "1", "field": "code", "value": "A"}"#,
            "\n",
            r#"{"record": "1", "field": "name", "value": "bar"}"#,
            "\n",
        ),
    )
    .unwrap();
    let output = run(update.as_path());
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"synchronized\": 1"));

    let customers = objects_of(&store, "Crm.Customer");
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0]["values"]["Name"]["value"], "bar");
}

#[test]
fn test_run_reports_bad_input_line() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("mapping.toml");
    let input = temp_dir.path().join("records.jsonl");
    std::fs::write(&config, MAPPING).unwrap();
    std::fs::write(&input, "{\"record\": \"1\"}\n").unwrap();

    let output = binary()
        .args(["--log", "error", "run", "--config"])
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--store")
        .arg(temp_dir.path().join("store.json"))
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 1"), "stderr: {}", stderr);
}
