use super::*;

use std::{io::Write, path::Path};

use shared::domain::{AppSource, TargetApp};

fn parse(args: &[&str]) -> Args {
    Args::try_parse_from(std::iter::once("patchctl").chain(args.iter().copied()))
        .expect("parse args")
}

fn config() -> PatchConfig {
    PatchConfig::for_target(TargetApp {
        package_name: PackageName::new("com.example.app"),
        label: "Example".into(),
        apk_paths: vec![PathBuf::from("/tmp/base.apk")],
        source: AppSource::Storage,
    })
}

#[test]
fn defaults_leave_session_defaults_alone() {
    let args = parse(&["base.apk"]);
    let mut cfg = config();
    args.apply(&mut cfg).expect("apply");
    assert_eq!(cfg, config());
}

/// Minimal APK whose compiled manifest declares only `package`.
fn write_apk(path: &Path, package: &str) {
    const NO_ENTRY: u32 = 0xFFFF_FFFF;
    let strings = ["manifest", "package", package];

    let mut data = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        let units: Vec<u16> = s.encode_utf16().collect();
        data.extend_from_slice(&(units.len() as u16).to_le_bytes());
        units.iter().for_each(|unit| data.extend_from_slice(&unit.to_le_bytes()));
        data.extend_from_slice(&0u16.to_le_bytes());
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }

    let mut pool = Vec::new();
    let strings_start = 28 + 4 * strings.len() as u32;
    for word in [0x001C_0001, strings_start + data.len() as u32, 3, 0, 0, strings_start, 0] {
        pool.extend_from_slice(&u32::to_le_bytes(word));
    }
    offsets.iter().for_each(|offset| pool.extend_from_slice(&offset.to_le_bytes()));
    pool.extend(data);

    // <manifest package="..."> with one string attribute.
    let mut element = Vec::new();
    for word in [0x0010_0102, 56, 1, NO_ENTRY, NO_ENTRY, 0, 0x0014_0014, 1, 0] {
        element.extend_from_slice(&u32::to_le_bytes(word));
    }
    for word in [NO_ENTRY, 1, 2, 0x0300_0008, 2] {
        element.extend_from_slice(&u32::to_le_bytes(word));
    }

    let mut manifest = Vec::new();
    manifest.extend_from_slice(&0x0008_0003u32.to_le_bytes());
    manifest.extend_from_slice(&((8 + pool.len() + element.len()) as u32).to_le_bytes());
    manifest.extend(pool);
    manifest.extend(element);

    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).expect("create apk"));
    zip.start_file("AndroidManifest.xml", zip::write::SimpleFileOptions::default())
        .expect("start manifest");
    zip.write_all(&manifest).expect("write manifest");
    zip.finish().expect("finish apk");
}

#[test]
fn package_name_comes_from_base_apk_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("base.apk");
    let split = dir.path().join("split_config.arm64_v8a.apk");
    write_apk(&base, "com.example.app");
    write_apk(&split, "com.example.app");

    let args = parse(&[
        base.to_str().expect("utf-8 path"),
        split.to_str().expect("utf-8 path"),
    ]);
    assert_eq!(
        args.package_name().expect("package"),
        PackageName::new("com.example.app")
    );

    let explicit = parse(&["--package", "org.example", "base.apk"]);
    assert_eq!(
        explicit.package_name().expect("package"),
        PackageName::new("org.example")
    );
}

#[test]
fn unreadable_manifest_requires_explicit_package() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("com.example.app.apk");
    std::fs::write(&base, b"not an apk").expect("write");

    let args = parse(&[base.to_str().expect("utf-8 path")]);
    let err = args.package_name().expect_err("file name must not be used");
    assert!(format!("{err:#}").contains("--package"), "{err:#}");
}

#[test]
fn portable_mode_embeds_modules_and_applies_flags() {
    let args = parse(&[
        "--portable",
        "--embed",
        "org.example.module=/tmp/module.apk",
        "--debuggable",
        "--override-version-code",
        "--sign",
        "v1,v2",
        "--sigbypass",
        "0",
        "base.apk",
    ]);
    let mut cfg = config();
    args.apply(&mut cfg).expect("apply");

    assert!(!cfg.use_manager_mode);
    assert_eq!(cfg.effective_modules().len(), 1);
    assert_eq!(
        cfg.effective_modules()[0].package_name,
        PackageName::new("org.example.module")
    );
    assert!(cfg.debuggable);
    assert!(cfg.override_version_code);
    assert_eq!(cfg.signature_label(), "V1 + V2");
    assert_eq!(cfg.sig_bypass_level, SigBypassLevel::Disable);
}

#[test]
fn no_sign_clears_schemes() {
    let args = parse(&["--no-sign", "base.apk"]);
    let mut cfg = config();
    args.apply(&mut cfg).expect("apply");
    assert_eq!(cfg.signature_label(), "None");
}

#[test]
fn embed_without_portable_is_rejected() {
    let args = parse(&["--embed", "org.example.module=/tmp/module.apk", "base.apk"]);
    let mut cfg = config();
    assert!(args.apply(&mut cfg).is_err());
}

#[test]
fn malformed_values_fail_to_parse() {
    let bad = [
        vec!["patchctl", "--embed", "no-separator", "base.apk"],
        vec!["patchctl", "--sigbypass", "3", "base.apk"],
        vec!["patchctl", "--sign", "v3", "base.apk"],
        vec!["patchctl", "--sign", "v1", "--no-sign", "base.apk"],
        vec!["patchctl"],
    ];
    for argv in bad {
        assert!(Args::try_parse_from(&argv).is_err(), "accepted {argv:?}");
    }
}
