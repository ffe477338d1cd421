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

//! Contract with the external miner binary. One subprocess per work item;
//! the binary prints a single JSON object on stdout and honors SIGTERM for
//! abort-on-expiry.

use hiveminer_logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::halt;
use crate::work::WorkItem;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// How long an aborted subprocess gets to exit after SIGTERM before SIGKILL
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// The single JSON object the miner binary prints on stdout
#[derive(Debug, Clone, Deserialize)]
pub struct MinerOutput {
    pub success: bool,
    pub nonce: Option<String>,
    pub preimage: Option<String>,
    pub hash: Option<String>,
    pub message: Option<String>,
}

/// Outcome of one mining pass
#[derive(Debug)]
pub enum MineOutcome {
    /// A qualifying nonce was found
    Solved(MinerOutput),
    /// Exit 0 with `success: false`; a legitimate empty pass
    Unsolved(Option<String>),
    /// The subprocess was terminated on request
    Aborted,
    /// Non-zero exit or garbage on stdout
    Crashed(String),
}

pub struct Miner {
    binary: PathBuf,
}

impl Miner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn command(&self, item: &WorkItem) -> Command {
        let challenge = &item.challenge;
        let mut command = Command::new(&self.binary);
        command
            .arg("--address")
            .arg(&item.address)
            .arg("--challenge-id")
            .arg(&challenge.challenge_id)
            .arg("--difficulty")
            .arg(&challenge.difficulty)
            .arg("--no-pre-mine")
            .arg(&challenge.no_pre_mine)
            .arg("--latest-submission")
            .arg(challenge.latest_submission.to_rfc3339())
            .arg("--no-pre-mine-hour")
            .arg(&challenge.no_pre_mine_hour)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run one pass for `item`. The abort receiver terminates the subprocess
    /// with SIGTERM and an escalation to SIGKILL after [`TERM_GRACE`].
    pub async fn mine(
        &self,
        item: &WorkItem,
        abort: &mut halt::Receiver,
    ) -> error::Result<MineOutcome> {
        let mut child = self
            .command(item)
            .spawn()
            .map_err(|e| ErrorKind::Miner(format!("spawn failed: {}", e)))?;
        let pid = child.id();
        let mut stdout = child
            .stdout
            .take()
            .expect("BUG: miner subprocess stdout not captured");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let mut raw = String::new();
                stdout.read_to_string(&mut raw).await?;

                if !status.success() {
                    return Ok(MineOutcome::Crashed(format!(
                        "exit status {:?}",
                        status.code()
                    )));
                }
                match serde_json::from_str::<MinerOutput>(raw.trim()) {
                    Ok(output) if output.success => {
                        if output.nonce.is_none() {
                            return Ok(MineOutcome::Crashed(
                                "success reported without a nonce".to_string(),
                            ));
                        }
                        Ok(MineOutcome::Solved(output))
                    }
                    Ok(output) => Ok(MineOutcome::Unsolved(output.message)),
                    Err(e) => Ok(MineOutcome::Crashed(format!("unreadable output: {}", e))),
                }
            }
            _ = abort.wait_for_halt() => {
                debug!("Miner: aborting pass for {}", item.key());
                if let Some(pid) = pid {
                    // SIGTERM first; the contract requires prompt handling
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                    warn!("Miner: {} ignored SIGTERM, killing", item.key());
                    let _ = child.kill().await;
                }
                Ok(MineOutcome::Aborted)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{challenge_closing_in, ManualClock};

    use chrono::{Duration as ChronoDuration, Utc};

    fn item() -> WorkItem {
        let clock = ManualClock::new(Utc::now());
        WorkItem::new(
            "a".to_string(),
            challenge_closing_in("c1", "ff", &clock, ChronoDuration::hours(1)),
        )
    }

    /// Fake miner binary backed by a shell one-liner
    fn script_miner(script: &str) -> (Miner, tempfile::TempDir) {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", script).unwrap();
        let mut permissions = file.metadata().unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        drop(file);
        (Miner::new(path), dir)
    }

    #[tokio::test]
    async fn test_solved_output_is_parsed() {
        let (miner, _dir) = script_miner(
            r#"echo '{"success": true, "nonce": "12345", "hash": "0000beef"}'"#,
        );
        let (_halt_sender, mut abort) = crate::halt::make_pair();

        match miner.mine(&item(), &mut abort).await.unwrap() {
            MineOutcome::Solved(output) => {
                assert_eq!(output.nonce.as_deref(), Some("12345"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolved_pass_is_not_a_crash() {
        let (miner, _dir) =
            script_miner(r#"echo '{"success": false, "message": "no luck"}'"#);
        let (_halt_sender, mut abort) = crate::halt::make_pair();

        match miner.mine(&item(), &mut abort).await.unwrap() {
            MineOutcome::Unsolved(message) => {
                assert_eq!(message.as_deref(), Some("no luck"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_crash() {
        let (miner, _dir) = script_miner("exit 3");
        let (_halt_sender, mut abort) = crate::halt::make_pair();

        match miner.mine(&item(), &mut abort).await.unwrap() {
            MineOutcome::Crashed(reason) => assert!(reason.contains("3")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_output_is_a_crash() {
        let (miner, _dir) = script_miner("echo not-json");
        let (_halt_sender, mut abort) = crate::halt::make_pair();

        match miner.mine(&item(), &mut abort).await.unwrap() {
            MineOutcome::Crashed(_) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_terminates_long_running_pass() {
        let (miner, _dir) = script_miner("sleep 60");
        let (halt_sender, mut abort) = crate::halt::make_pair();

        let started = std::time::Instant::now();
        let handle = {
            let item = item();
            tokio::spawn(async move { miner.mine(&item, &mut abort).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        halt_sender.stop();

        match handle.await.unwrap().unwrap() {
            MineOutcome::Aborted => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        // the subprocess went down with SIGTERM, well before its sleep ended
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
