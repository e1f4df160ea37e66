use super::*;
use shared::session::InstallStatus;

#[test]
fn parses_package_list_output() {
    let text = "package:com.android.settings\npackage:com.example.app\n\nWARNING: linker\n";
    assert_eq!(
        parse_package_list(text),
        vec![
            PackageName::new("com.android.settings"),
            PackageName::new("com.example.app"),
        ]
    );
}

#[test]
fn streamed_install_success() {
    let result = parse_package_command_output(true, "Performing Streamed Install\nSuccess\n", "");
    assert!(result.is_success());
}

#[test]
fn signature_mismatch_is_a_conflict() {
    let result = parse_package_command_output(
        false,
        "Performing Streamed Install\n",
        "adb: failed to install base.apk: Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: Package com.example.app signatures do not match previously installed version; ignoring!]\n",
    );
    assert_eq!(
        result.status,
        InstallStatus::Failure {
            code: STATUS_FAILURE_CONFLICT
        }
    );
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .starts_with("INSTALL_FAILED_UPDATE_INCOMPATIBLE"));
}

#[test]
fn failure_codes_follow_reason() {
    assert_eq!(failure_code("INSTALL_FAILED_NO_MATCHING_ABIS"), STATUS_FAILURE_INCOMPATIBLE);
    assert_eq!(failure_code("INSTALL_PARSE_FAILED_NO_CERTIFICATES"), STATUS_FAILURE_INVALID);
    assert_eq!(failure_code("INSTALL_FAILED_INSUFFICIENT_STORAGE"), STATUS_FAILURE_STORAGE);
    assert_eq!(failure_code("INSTALL_FAILED_USER_RESTRICTED"), STATUS_FAILURE_BLOCKED);
    assert_eq!(failure_code("INSTALL_FAILED_ABORTED"), STATUS_FAILURE_ABORTED);
    assert_eq!(failure_code("DELETE_FAILED_INTERNAL_ERROR"), STATUS_FAILURE);
}

#[test]
fn unexplained_error_keeps_output_as_message() {
    let result = parse_package_command_output(false, "", "adb: device offline\n");
    assert_eq!(result.status, InstallStatus::Failure { code: STATUS_FAILURE });
    assert_eq!(result.message.as_deref(), Some("adb: device offline"));

    let silent = parse_package_command_output(false, "", "");
    assert_eq!(silent.message.as_deref(), Some("adb exited with an error"));
}

#[tokio::test]
async fn unreachable_adb_is_unavailable_and_reports_failure() {
    let device = AdbDevice::new("/nonexistent/adb");
    assert!(device.connect().await.is_err());
    assert!(!device.is_available());

    let result = device
        .uninstall(&PackageName::new("com.example.app"))
        .await;
    assert!(result.is_reportable_failure());
    assert!(!device
        .is_package_installed_without_patch(&PackageName::new("com.example.app"))
        .await);
}
