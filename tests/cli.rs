//! Command-line behaviour of the `wcap` binary.
//!
//! Only paths that fail or exit before touching netlink are covered here.

use std::io::Write;
use std::process::{Command, Output};

fn wcap(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wcap"))
        .args(args)
        .env_remove("WCAP_CONFIG")
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

#[test]
fn test_help_exits_zero() {
    let output = wcap(&["-h"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("WIFACE"));
    assert!(stdout.contains("IFACE"));
}

#[test]
fn test_missing_role_is_a_usage_error() {
    let output = wcap(&["wlan0", "eth0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_both_roles_is_a_usage_error() {
    let output = wcap(&["-s", "-c", "169.254.1.1", "wlan0", "eth0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_interfaces_is_a_usage_error() {
    let output = wcap(&["-s"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_bad_peer_address_is_a_usage_error() {
    let output = wcap(&["-c", "not-an-address", "wlan0", "eth0"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unreadable_config_fails_with_usage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let output = wcap(&["-s", "--config", path.to_str().unwrap(), "wlan0", "eth0"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"));
}

#[test]
fn test_invalid_config_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[relay]\nport = 0").unwrap();

    let output = wcap(&[
        "-s",
        "--config",
        file.path().to_str().unwrap(),
        "wlan0",
        "eth0",
    ]);

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_overlong_interface_name_fails() {
    let output = wcap(&["-s", "wlan0", "an-interface-name-too-long"]);
    assert_eq!(output.status.code(), Some(1));
}
