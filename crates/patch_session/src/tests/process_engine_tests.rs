use super::*;
use std::path::Path;

use shared::domain::{AppSource, ModuleApp, PackageName, SigBypassLevel, TargetApp};

use crate::log_sink::LogSink;

fn config() -> PatchConfig {
    PatchConfig::for_target(TargetApp {
        package_name: PackageName::new("com.example.app"),
        label: "Example".into(),
        apk_paths: vec![PathBuf::from("/scratch/base.apk")],
        source: AppSource::Storage,
    })
}

fn as_strings(args: Vec<OsString>) -> Vec<String> {
    args.into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[test]
fn default_options_render_manager_mode_arguments() {
    let engine = CommandPatchEngine::new("lspatch", "/out")
        .with_base_args(vec!["-jar".into(), "lspatch.jar".into()]);

    assert_eq!(
        as_strings(engine.command_args(&config())),
        vec![
            "-jar", "lspatch.jar", "/scratch/base.apk", "-o", "/out", "-f", "-l", "2", "--v1",
            "false", "--v2", "true", "--manager",
        ]
    );
}

#[test]
fn portable_mode_embeds_modules_in_order() {
    let mut config = config();
    config.use_manager_mode = false;
    config.debuggable = true;
    config.override_version_code = true;
    config.sig_bypass_level = SigBypassLevel::Disable;
    config.signature_schemes.insert(SignatureScheme::V1);
    config.embedded_modules = vec![
        ModuleApp {
            package_name: PackageName::new("com.example.first"),
            apk_path: PathBuf::from("/modules/first.apk"),
        },
        ModuleApp {
            package_name: PackageName::new("com.example.second"),
            apk_path: PathBuf::from("/modules/second.apk"),
        },
    ];

    let args = as_strings(CommandPatchEngine::new("lspatch", "/out").with_verbose(true).command_args(&config));
    assert_eq!(
        args,
        vec![
            "/scratch/base.apk", "-o", "/out", "-f", "-l", "0", "--v1", "true", "--v2", "true",
            "-d", "-r", "-m", "/modules/first.apk", "-m", "/modules/second.apk", "-v",
        ]
    );
}

#[cfg(unix)]
#[test]
fn streams_stdout_as_info_and_stderr_as_error() {
    let out = tempfile::tempdir().expect("out");
    let engine = CommandPatchEngine::new("/bin/sh", out.path()).with_base_args(vec![
        "-c".into(),
        "echo 'Patching started'; echo 'warning: debug cert' >&2; echo 'Patching finished'".into(),
    ]);
    let sink = LogSink::new(false);
    sink.open();

    engine.patch(&sink, &config()).expect("patch");

    let lines = sink.lines();
    let info: Vec<_> = lines
        .iter()
        .filter(|line| line.level == shared::session::LogLevel::Info)
        .map(|line| line.message.as_str())
        .collect();
    assert_eq!(info, vec!["Patching started", "Patching finished"]);
    assert!(lines
        .iter()
        .any(|line| line.level == shared::session::LogLevel::Error
            && line.message == "warning: debug cert"));
}

#[cfg(unix)]
#[test]
fn non_zero_exit_is_an_engine_failure() {
    let out = tempfile::tempdir().expect("out");
    let engine = CommandPatchEngine::new("/bin/sh", out.path())
        .with_base_args(vec!["-c".into(), "exit 3".into()]);
    let sink = LogSink::new(false);
    sink.open();

    let err = engine.patch(&sink, &config()).expect_err("must fail");
    assert!(err.to_string().contains("patcher exited"));
}

#[test]
fn missing_program_is_an_engine_failure() {
    let out = tempfile::tempdir().expect("out");
    let engine = CommandPatchEngine::new(Path::new("/nonexistent/patcher-binary"), out.path());
    let sink = LogSink::new(false);
    sink.open();

    let err = engine.patch(&sink, &config()).expect_err("must fail");
    assert!(err.to_string().contains("failed to start patcher"));
}
