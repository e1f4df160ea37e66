use super::*;

use std::io::Write;

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

type Attributes<'a> = &'a [(&'a str, &'a str)];

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_header(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16, size: usize) {
    push_u16(buf, chunk_type);
    push_u16(buf, header_size);
    push_u32(buf, size as u32);
}

fn intern(strings: &mut Vec<String>, value: &str) -> u32 {
    match strings.iter().position(|s| s == value) {
        Some(index) => index as u32,
        None => {
            strings.push(value.to_string());
            (strings.len() - 1) as u32
        }
    }
}

fn string_pool(strings: &[String], utf8: bool) -> Vec<u8> {
    let mut data = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        if utf8 {
            data.push(s.chars().count() as u8);
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            push_u16(&mut data, units.len() as u16);
            for unit in units {
                push_u16(&mut data, unit);
            }
            push_u16(&mut data, 0);
        }
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }

    let strings_start = 28 + 4 * strings.len();
    let mut chunk = Vec::new();
    push_header(&mut chunk, RES_STRING_POOL_TYPE, 28, strings_start + data.len());
    push_u32(&mut chunk, strings.len() as u32);
    push_u32(&mut chunk, 0);
    push_u32(&mut chunk, if utf8 { STRING_FLAG_UTF8 } else { 0 });
    push_u32(&mut chunk, strings_start as u32);
    push_u32(&mut chunk, 0);
    for offset in offsets {
        push_u32(&mut chunk, offset);
    }
    chunk.extend(data);
    chunk
}

/// Compiles `elements` into the binary XML layout aapt emits, with string
/// attribute values.
fn compiled_manifest(elements: &[(&str, Attributes<'_>)], utf8: bool) -> Vec<u8> {
    let mut strings = Vec::new();
    let mut body = Vec::new();
    for (tag, attributes) in elements {
        let name = intern(&mut strings, tag);
        let mut ext = Vec::new();
        push_u32(&mut ext, NO_ENTRY);
        push_u32(&mut ext, name);
        push_u16(&mut ext, 20);
        push_u16(&mut ext, 20);
        push_u16(&mut ext, attributes.len() as u16);
        push_u16(&mut ext, 0);
        push_u16(&mut ext, 0);
        push_u16(&mut ext, 0);
        for (attribute, value) in attributes.iter() {
            let attribute = intern(&mut strings, attribute);
            let value = intern(&mut strings, value);
            push_u32(&mut ext, NO_ENTRY);
            push_u32(&mut ext, attribute);
            push_u32(&mut ext, value);
            push_u16(&mut ext, 8);
            ext.push(0);
            ext.push(TYPE_STRING);
            push_u32(&mut ext, value);
        }

        push_header(&mut body, RES_XML_START_ELEMENT_TYPE, 16, 16 + ext.len());
        push_u32(&mut body, 1);
        push_u32(&mut body, NO_ENTRY);
        body.extend(ext);
    }

    let pool = string_pool(&strings, utf8);
    let mut document = Vec::new();
    push_header(&mut document, RES_XML_TYPE, 8, 8 + pool.len() + body.len());
    document.extend(pool);
    document.extend(body);
    document
}

fn write_apk(path: &Path, manifest: &[u8]) {
    let file = File::create(path).expect("create apk");
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file("classes.dex", options).expect("start dex");
    zip.write_all(b"dex\n035\0").expect("write dex");
    zip.start_file(MANIFEST_ENTRY, options).expect("start manifest");
    zip.write_all(manifest).expect("write manifest");
    zip.finish().expect("finish apk");
}

#[test]
fn reads_package_and_application_from_utf16_pool() {
    let data = compiled_manifest(
        &[
            ("manifest", &[("versionName", "1.0"), ("package", "com.example.app")]),
            ("uses-sdk", &[("minSdkVersion", "28")]),
            (
                "application",
                &[
                    ("name", "com.example.app.App"),
                    ("appComponentFactory", "androidx.core.app.CoreComponentFactory"),
                ],
            ),
        ],
        false,
    );

    let manifest = parse_binary_manifest(&data).expect("parse");
    assert_eq!(
        manifest,
        ApkManifest {
            package_name: Some("com.example.app".into()),
            application_name: Some("com.example.app.App".into()),
            app_component_factory: Some("androidx.core.app.CoreComponentFactory".into()),
        }
    );
    assert_eq!(
        manifest.package().expect("package"),
        PackageName::new("com.example.app")
    );
}

#[test]
fn reads_utf8_pool() {
    let data = compiled_manifest(&[("manifest", &[("package", "org.example.täst")])], true);
    let manifest = parse_binary_manifest(&data).expect("parse");
    assert_eq!(manifest.package_name.as_deref(), Some("org.example.täst"));
    assert_eq!(manifest.application_name, None);
}

#[test]
fn split_named_base_apk_reports_its_real_package() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app_dir = dir.path().join("com.example.app");
    std::fs::create_dir(&app_dir).expect("app dir");
    let base = app_dir.join("base.apk");
    write_apk(
        &base,
        &compiled_manifest(&[("manifest", &[("package", "com.example.app")])], false),
    );

    let manifest = read_apk_manifest(&base).expect("read manifest");
    assert_eq!(
        manifest.package().expect("package"),
        PackageName::new("com.example.app")
    );
}

#[test]
fn manifest_without_package_is_reported() {
    let data = compiled_manifest(&[("manifest", &[("versionCode", "3")])], false);
    let manifest = parse_binary_manifest(&data).expect("parse");
    assert!(matches!(manifest.package(), Err(ManifestError::MissingPackage)));
}

#[test]
fn non_apk_and_truncated_input_fail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("base.apk");
    std::fs::write(&path, b"not a zip").expect("write");
    assert!(matches!(
        read_apk_manifest(&path),
        Err(ManifestError::Archive { .. })
    ));
    assert!(matches!(
        read_apk_manifest(&dir.path().join("missing.apk")),
        Err(ManifestError::Io { .. })
    ));

    let data = compiled_manifest(&[("manifest", &[("package", "com.example.app")])], false);
    assert!(matches!(
        parse_binary_manifest(&data[..data.len() - 6]),
        Err(ManifestError::Malformed(_))
    ));
    assert!(matches!(
        parse_binary_manifest(b"PK\x03\x04"),
        Err(ManifestError::Malformed(_))
    ));
}
