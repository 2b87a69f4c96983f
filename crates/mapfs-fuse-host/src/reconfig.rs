// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Line-oriented reconfiguration channel
//!
//! Each input line is a JSON [`ReconfigRequest`]; each request gets exactly
//! one JSON [`ReconfigResponse`] line back.

use mapfs_core::{FsResult, Mapping, MappingSpec};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigRequest {
    pub mappings: Vec<Mapping>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReconfigResponse {
    fn success() -> Self {
        Self { ok: true, error: None }
    }

    fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Serve requests from `input` until it ends, handing each spec to `apply`.
///
/// Returns the number of requests that were applied successfully.
pub fn serve<R, W, F>(input: R, mut output: W, mut apply: F) -> io::Result<usize>
where
    R: BufRead,
    W: Write,
    F: FnMut(MappingSpec) -> FsResult<()>,
{
    let mut applied = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ReconfigRequest>(&line) {
            Ok(request) => {
                let spec = MappingSpec::new(request.mappings);
                debug!(target: "mapfs::reconfig", mappings = spec.len(), "reconfiguration requested");
                match apply(spec) {
                    Ok(()) => {
                        applied += 1;
                        info!(target: "mapfs::reconfig", "reconfiguration applied");
                        ReconfigResponse::success()
                    }
                    Err(err) => {
                        warn!(target: "mapfs::reconfig", %err, "reconfiguration rejected");
                        ReconfigResponse::failure(err)
                    }
                }
            }
            Err(err) => {
                warn!(target: "mapfs::reconfig", %err, "malformed reconfiguration request");
                ReconfigResponse::failure(format!("malformed request: {err}"))
            }
        };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(applied)
}
