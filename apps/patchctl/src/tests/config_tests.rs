use super::*;

use std::collections::HashMap;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn empty_file_keeps_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("patchctl.toml");
    fs::write(&path, "").expect("write settings");

    let settings = load_settings_with(Some(&path), env_of(&[])).expect("settings");
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.patcher_args, vec!["-jar", "lspatch.jar"]);
}

#[test]
fn explicit_file_must_exist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load_settings_with(Some(&dir.path().join("absent.toml")), env_of(&[]))
        .expect_err("missing explicit file");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("patchctl.toml");
    fs::write(
        &path,
        r#"
output_dir = "/srv/patched"
patcher_program = "/opt/lspatch/bin/lspatch"
patcher_args = []
device_serial = "emulator-5554"
verbose = true
"#,
    )
    .expect("write settings");

    let settings = load_settings_with(Some(&path), env_of(&[])).expect("settings");
    assert_eq!(settings.output_dir, PathBuf::from("/srv/patched"));
    assert_eq!(
        settings.patcher_program,
        PathBuf::from("/opt/lspatch/bin/lspatch")
    );
    assert!(settings.patcher_args.is_empty());
    assert_eq!(settings.device_serial.as_deref(), Some("emulator-5554"));
    assert!(settings.verbose);
    assert_eq!(settings.adb_program, PathBuf::from("adb"));
}

#[test]
fn environment_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("patchctl.toml");
    fs::write(&path, "output_dir = \"/srv/patched\"\nverbose = true\n").expect("write settings");

    let settings = load_settings_with(
        Some(&path),
        env_of(&[
            ("PATCHCTL_OUTPUT_DIR", "/tmp/out"),
            ("PATCHCTL_PATCHER_ARGS", "-jar /opt/lspatch.jar"),
            ("ANDROID_SERIAL", "usb-1"),
            ("PATCHCTL_SERIAL", "usb-2"),
            ("PATCHCTL_VERBOSE", "0"),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.output_dir, PathBuf::from("/tmp/out"));
    assert_eq!(settings.patcher_args, vec!["-jar", "/opt/lspatch.jar"]);
    assert_eq!(settings.device_serial.as_deref(), Some("usb-2"));
    assert!(!settings.verbose);
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("patchctl.toml");
    fs::write(&path, "output = \"/srv/patched\"\n").expect("write settings");

    let err = load_settings_with(Some(&path), env_of(&[])).expect_err("unknown key");
    assert!(err.to_string().contains("invalid settings file"));
}
