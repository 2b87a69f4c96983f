// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

// Without the `fuse` feature the host builds the tree and serves the
// reconfiguration channel without mounting, which is what these tests drive.
#[cfg(not(feature = "fuse"))]
mod without_fuse {
    use std::io::Write;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    #[test]
    fn reconfiguration_requests_are_answered_line_by_line() {
        let real = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();

        let mut child = Command::new(env!("CARGO_BIN_EXE_mapfs-fuse-host"))
            .arg(mount.path())
            .arg("--reconfig")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("able to execute mapfs-fuse-host");

        {
            let stdin = child.stdin.as_mut().expect("stdin");
            let good = format!(
                "{{\"mappings\":[{{\"path\":\"/data\",\"underlying_path\":{:?},\"writable\":true}}]}}\n",
                real.path().display().to_string()
            );
            stdin.write_all(good.as_bytes()).unwrap();
            stdin
                .write_all(b"{\"mappings\":[{\"path\":\"/x\",\"underlying_path\":\"/does/not/exist\"}]}\n")
                .unwrap();
            stdin.write_all(b"garbage\n").unwrap();
        }
        drop(child.stdin.take());

        let output = child.wait_with_output().unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        let answers: Vec<serde_json::Value> = stdout
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0]["ok"], true);
        assert_eq!(answers[1]["ok"], false);
        assert!(answers[1]["error"].as_str().unwrap().contains("/x"));
        assert_eq!(answers[2]["ok"], false);
    }
}
