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

//! Distribution of the miner-code archive through the shared bucket. The
//! controller uploads it with its SHA-256 in object metadata; workers verify
//! the checksum before unpacking and skip the download when already current.

use hiveminer_logging::macros::*;

use hiveminer::error::{self, ErrorKind};
use hiveminer::hal::{Clock, ObjectStore};

use sha2::{Digest, Sha256};
use tokio::process::Command;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Archive key within the regional bucket
pub const MINER_CODE_KEY: &str = "miner-code.tar.gz";

const CHECKSUM_META: &str = "checksum";
const UPLOADED_AT_META: &str = "uploadedAt";

/// Marker file remembering the checksum of the last unpacked archive
const CHECKSUM_MARKER: &str = "miner-code.sha256";

fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Upload the archive; returns its checksum
pub async fn upload_miner_code(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    archive: &Path,
) -> error::Result<String> {
    let body = fs::read(archive)?;
    let checksum = sha256_hex(&body);

    let mut metadata = HashMap::new();
    metadata.insert(CHECKSUM_META.to_string(), checksum.clone());
    metadata.insert(UPLOADED_AT_META.to_string(), clock.now().to_rfc3339());

    store
        .put_with_metadata(MINER_CODE_KEY, body, metadata)
        .await?;
    let archive_len = fs::metadata(archive)?.len();
    info!("Deploy: uploaded miner code ({} bytes), sha256 {}", archive_len, checksum);
    Ok(checksum)
}

/// Fetch, verify and unpack the archive into `dest_dir`. Returns `false` when
/// no archive has been deployed or the local copy is already current.
pub async fn fetch_miner_code(store: &dyn ObjectStore, dest_dir: &Path) -> error::Result<bool> {
    let meta = match store.head(MINER_CODE_KEY).await? {
        Some(meta) => meta,
        None => {
            debug!("Deploy: no miner code deployed yet");
            return Ok(false);
        }
    };
    let expected = meta.metadata.get(CHECKSUM_META).cloned();

    let marker = dest_dir.join(CHECKSUM_MARKER);
    if let (Some(expected), Ok(current)) = (&expected, fs::read_to_string(&marker)) {
        if current.trim() == expected {
            debug!("Deploy: miner code already current ({})", expected);
            return Ok(false);
        }
    }

    let object = store
        .get(MINER_CODE_KEY)
        .await?
        .ok_or_else(|| error::Error::from(ErrorKind::Store("miner code vanished".to_string())))?;
    let checksum = sha256_hex(&object.body);
    if let Some(expected) = &expected {
        if &checksum != expected {
            return Err(ErrorKind::Store(format!(
                "miner code checksum mismatch: got {}, metadata says {}",
                checksum, expected
            )))?;
        }
    }

    fs::create_dir_all(dest_dir)?;
    let archive = dest_dir.join(MINER_CODE_KEY);
    fs::write(&archive, &object.body)?;

    let status = Command::new("tar")
        .arg("-xzf")
        .arg(&archive)
        .arg("-C")
        .arg(dest_dir)
        .status()
        .await?;
    if !status.success() {
        return Err(ErrorKind::General(format!(
            "unpacking miner code failed with {:?}",
            status.code()
        )))?;
    }

    fs::write(&marker, &checksum)?;
    info!("Deploy: unpacked miner code {} into {:?}", checksum, dest_dir);
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use hiveminer::test_utils::{MemStore, ManualClock};

    use chrono::Utc;
    use std::process::Command as StdCommand;
    use std::sync::Arc;

    fn make_archive(dir: &Path) -> std::path::PathBuf {
        let payload_dir = dir.join("payload");
        fs::create_dir_all(&payload_dir).unwrap();
        fs::write(payload_dir.join("miner"), b"#!/bin/sh\nexit 0\n").unwrap();

        let archive = dir.join("code.tar.gz");
        let status = StdCommand::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&payload_dir)
            .arg("miner")
            .status()
            .unwrap();
        assert!(status.success());
        archive
    }

    #[tokio::test]
    async fn test_upload_fetch_roundtrip_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let clock = ManualClock::new(Utc::now());
        let archive = make_archive(dir.path());

        let checksum = upload_miner_code(store.as_ref(), &clock, &archive)
            .await
            .unwrap();

        let dest = dir.path().join("unpacked");
        assert!(fetch_miner_code(store.as_ref(), &dest).await.unwrap());
        assert!(dest.join("miner").exists());
        assert_eq!(
            fs::read_to_string(dest.join(CHECKSUM_MARKER)).unwrap(),
            checksum
        );

        // a second fetch is a no-op because the marker matches
        assert!(!fetch_miner_code(store.as_ref(), &dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_without_deploy_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        assert!(!fetch_miner_code(store.as_ref(), dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let clock = ManualClock::new(Utc::now());
        let archive = make_archive(dir.path());

        upload_miner_code(store.as_ref(), &clock, &archive)
            .await
            .unwrap();
        // corrupt the stored body while keeping the metadata checksum
        let meta = store.head(MINER_CODE_KEY).await.unwrap().unwrap();
        store
            .put_with_metadata(MINER_CODE_KEY, b"garbage".to_vec(), meta.metadata)
            .await
            .unwrap();

        let dest = dir.path().join("unpacked");
        assert!(fetch_miner_code(store.as_ref(), &dest).await.is_err());
    }
}
