//! Serializer tests: JSON and YAML metas, canonical output, determinism.

use std::path::Path;

use tempfile::TempDir;

use catalogd::serializer::write_catalog;

fn serialize(root: &Path) -> Vec<u8> {
    let mut out = Vec::new();
    write_catalog(root, &mut out).unwrap();
    out
}

#[test]
fn compacts_json_metas_with_sorted_keys() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("catalog.json"),
        r#"{
  "schema": "olm.package",
  "name": "cockroachdb",
  "defaultChannel": "stable-v6.x"
}
{
  "entries": [
    {"name": "cockroachdb.v5.0.3"},
    {"name": "cockroachdb.v5.0.4", "replaces": "cockroachdb.v5.0.3"}
  ],
  "name": "stable-5.x",
  "package": "cockroachdb",
  "schema": "olm.channel"
}
"#,
    )
    .unwrap();

    let out = serialize(temp.path());
    let expected = concat!(
        "{\"defaultChannel\":\"stable-v6.x\",\"name\":\"cockroachdb\",\"schema\":\"olm.package\"}\n",
        "{\"entries\":[{\"name\":\"cockroachdb.v5.0.3\"},{\"name\":\"cockroachdb.v5.0.4\",\"replaces\":\"cockroachdb.v5.0.3\"}],\"name\":\"stable-5.x\",\"package\":\"cockroachdb\",\"schema\":\"olm.channel\"}\n",
    );
    assert_eq!(String::from_utf8(out).unwrap(), expected);
}

#[test]
fn converts_yaml_documents_to_json_lines() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("catalog.yaml"),
        "---\ndefaultChannel: stable-v6.x\nname: cockroachdb\nschema: olm.package\n---\nentries:\n  - name: cockroachdb.v6.0.0\n    skipRange: \"<6.0.0\"\nname: stable-v6.x\npackage: cockroachdb\nschema: olm.channel\n",
    )
    .unwrap();

    let out = serialize(temp.path());
    let expected = concat!(
        "{\"defaultChannel\":\"stable-v6.x\",\"name\":\"cockroachdb\",\"schema\":\"olm.package\"}\n",
        "{\"entries\":[{\"name\":\"cockroachdb.v6.0.0\",\"skipRange\":\"<6.0.0\"}],\"name\":\"stable-v6.x\",\"package\":\"cockroachdb\",\"schema\":\"olm.channel\"}\n",
    );
    assert_eq!(String::from_utf8(out).unwrap(), expected);
}

#[test]
fn equal_json_and_yaml_catalogs_serialize_identically() {
    let json_dir = TempDir::new().unwrap();
    std::fs::write(
        json_dir.path().join("catalog.json"),
        "{\"schema\": \"olm.package\", \"name\": \"test\", \"defaultChannel\": \"stable\"}",
    )
    .unwrap();

    let yaml_dir = TempDir::new().unwrap();
    std::fs::write(
        yaml_dir.path().join("catalog.yaml"),
        "defaultChannel: stable\nname: test\nschema: olm.package\n",
    )
    .unwrap();

    assert_eq!(serialize(json_dir.path()), serialize(yaml_dir.path()));
}

#[test]
fn walk_order_is_lexical_and_recursive() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("aa")).unwrap();
    std::fs::write(
        temp.path().join("aa/nested.json"),
        "{\"schema\": \"olm.package\", \"name\": \"first\"}",
    )
    .unwrap();
    std::fs::write(
        temp.path().join("bb.yml"),
        "schema: olm.package\nname: second\n",
    )
    .unwrap();
    std::fs::write(
        temp.path().join("zz.json"),
        "{\"schema\": \"olm.package\", \"name\": \"third\"}",
    )
    .unwrap();

    let out = String::from_utf8(serialize(temp.path())).unwrap();
    let names: Vec<String> = out
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["name"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, ["first", "second", "third"]);
}

#[test]
fn byte_identical_inputs_produce_byte_identical_output() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("sub")).unwrap();
    std::fs::write(
        temp.path().join("a.json"),
        "{\"schema\": \"olm.bundle\", \"name\": \"a\", \"package\": \"p\"}",
    )
    .unwrap();
    std::fs::write(
        temp.path().join("sub/b.yaml"),
        "schema: olm.channel\nname: b\npackage: p\n",
    )
    .unwrap();

    assert_eq!(serialize(temp.path()), serialize(temp.path()));
}

#[test]
fn ignores_unrelated_and_hidden_files() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("catalog.json"),
        "{\"schema\": \"olm.package\", \"name\": \"kept\"}",
    )
    .unwrap();
    std::fs::write(temp.path().join("README.txt"), "not a meta").unwrap();
    std::fs::write(temp.path().join(".hidden.json"), "also not parsed").unwrap();

    let out = String::from_utf8(serialize(temp.path())).unwrap();
    assert_eq!(out.lines().count(), 1);
    assert!(out.contains("kept"));
}

#[test]
fn rejects_metas_without_schema() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("bad.json"), "{\"name\": \"no-schema\"}").unwrap();

    let mut out = Vec::new();
    assert!(write_catalog(temp.path(), &mut out).is_err());
}

#[test]
fn rejects_non_object_metas() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("bad.json"), "[1, 2, 3]").unwrap();

    let mut out = Vec::new();
    assert!(write_catalog(temp.path(), &mut out).is_err());
}

#[test]
fn rejects_malformed_yaml() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("bad.yaml"), ":\n  - [unbalanced").unwrap();

    let mut out = Vec::new();
    assert!(write_catalog(temp.path(), &mut out).is_err());
}

#[test]
fn empty_yaml_documents_are_skipped() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("catalog.yaml"),
        "---\n---\nschema: olm.package\nname: only\n",
    )
    .unwrap();

    let out = String::from_utf8(serialize(temp.path())).unwrap();
    assert_eq!(out, "{\"name\":\"only\",\"schema\":\"olm.package\"}\n");
}
