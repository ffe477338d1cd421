// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Contract with the external signing tool. Key material never enters this
//! process; the tool prints one JSON object with the signature and the
//! public key on stdout.

use crate::error::{self, ErrorKind};
use crate::hal;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// Signing is local and fast; anything longer means a wedged tool
const SIGN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SignerOutput {
    signature: String,
    pubkey: String,
}

/// External signing tool invoked as a subprocess
pub struct ToolSigner {
    binary: PathBuf,
}

impl ToolSigner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl hal::Signer for ToolSigner {
    async fn sign(&self, address: &str, message: &str) -> error::Result<hal::Signature> {
        let output = tokio::time::timeout(
            SIGN_TIMEOUT,
            Command::new(&self.binary)
                .arg("sign")
                .arg("--address")
                .arg(address)
                .arg("--message")
                .arg(message)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ErrorKind::Signer("signing tool timed out".to_string()))?
        .map_err(|e| ErrorKind::Signer(format!("spawn failed: {}", e)))?;

        if !output.status.success() {
            return Err(ErrorKind::Signer(format!(
                "signing tool exited with {:?}",
                output.status.code()
            )))?;
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let parsed: SignerOutput = serde_json::from_str(raw.trim())
            .map_err(|e| ErrorKind::Signer(format!("unreadable output: {}", e)))?;
        Ok(hal::Signature {
            signature: parsed.signature,
            pubkey: parsed.pubkey,
        })
    }
}
