// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

use std::path::PathBuf;
use std::process::Command;

fn host_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mapfs-fuse-host"))
}

#[test]
fn fuse_host_binary_help_runs() {
    // Running with --help must not attempt a mount
    let output = Command::new(host_binary())
        .arg("--help")
        .output()
        .expect("able to execute mapfs-fuse-host");

    assert!(output.status.success(), "--help should succeed");
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--mapping"));
    assert!(help.contains("--reconfig"));
}

#[test]
fn malformed_mapping_argument_is_rejected() {
    let output = Command::new(host_binary())
        .args(["/nonexistent-mount", "--mapping", "/a:/real/a:bogus"])
        .output()
        .expect("able to execute mapfs-fuse-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown access mode"), "stderr: {stderr}");
}
