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

//! Worker identity from the token-protected instance metadata service (IMDSv2)

use hiveminer::error::{self, ErrorKind};
use hiveminer::hal::MetadataProvider;

use async_trait::async_trait;

use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";

const TOKEN_TTL_SECONDS: &str = "21600";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ImdsMetadata {
    http: reqwest::Client,
    endpoint: String,
}

impl ImdsMetadata {
    pub fn new() -> error::Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: &str) -> error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ErrorKind::Metadata(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn token(&self) -> error::Result<String> {
        let response = self
            .http
            .put(&format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(|e| ErrorKind::Metadata(format!("token: {}", e)))?;
        if !response.status().is_success() {
            return Err(ErrorKind::Metadata(format!(
                "token request returned {}",
                response.status()
            )))?;
        }
        response
            .text()
            .await
            .map_err(|e| ErrorKind::Metadata(format!("token: {}", e)))
            .map_err(Into::into)
    }

    /// Fetch one metadata path; `Ok(None)` when the path does not exist for
    /// this instance (e.g. no public hostname inside a private subnet)
    async fn fetch(&self, path: &str) -> error::Result<Option<String>> {
        let token = self.token().await?;
        let response = self
            .http
            .get(&format!("{}/latest/meta-data/{}", self.endpoint, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .map_err(|e| ErrorKind::Metadata(format!("{}: {}", path, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ErrorKind::Metadata(format!(
                "{} returned {}",
                path,
                response.status()
            )))?;
        }
        let value = response
            .text()
            .await
            .map_err(|e| ErrorKind::Metadata(format!("{}: {}", path, e)))?;
        Ok(Some(value.trim().to_string()))
    }

    async fn fetch_required(&self, path: &str) -> error::Result<String> {
        self.fetch(path)
            .await?
            .ok_or_else(|| ErrorKind::Metadata(format!("{} is not available", path)).into())
    }
}

#[async_trait]
impl MetadataProvider for ImdsMetadata {
    async fn worker_id(&self) -> error::Result<String> {
        self.fetch_required("instance-id").await
    }

    async fn region(&self) -> error::Result<String> {
        self.fetch_required("placement/region").await
    }

    async fn public_endpoint(&self) -> error::Result<Option<String>> {
        Ok(self
            .fetch("public-hostname")
            .await?
            .filter(|hostname| !hostname.is_empty()))
    }
}
