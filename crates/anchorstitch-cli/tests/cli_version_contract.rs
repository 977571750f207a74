#[test]
fn version_contract() {
    let out = assert_cmd::Command::cargo_bin("anchorstitch")
        .expect("binary")
        .arg("version")
        .output()
        .expect("run anchorstitch version");

    assert!(out.status.success(), "anchorstitch version failed");
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("parse version json");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("anchorstitch"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}
