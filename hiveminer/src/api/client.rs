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

//! HTTP implementation of the Mine API and the donation address source

use hiveminer_logging::macros::*;

use crate::api;
use crate::backoff::{self, Backoff};
use crate::error::{self, ErrorKind};
use crate::hal;

use async_trait::async_trait;
use reqwest::StatusCode;

use std::time::Duration;

/// Read-path retry attempts before giving up until the next tick
const GET_RETRY_ATTEMPTS: u32 = 3;

const GET_RETRY_BASE: Duration = Duration::from_millis(500);
const GET_RETRY_CAP: Duration = Duration::from_secs(5);

/// Mine API client speaking HTTPS/JSON
pub struct MineClient {
    http: reqwest::Client,
    base: String,
}

impl MineClient {
    pub fn new(base_url: &str, timeout: Duration) -> error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ErrorKind::Api(e.to_string()))?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET with bounded jittered retry on transport errors and server errors
    async fn get_json<T>(&self, url: &str) -> error::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut backoff = Backoff::new(GET_RETRY_BASE, GET_RETRY_CAP);
        let mut last_error = String::new();
        for attempt in 0..GET_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff.next_delay() + backoff::jitter(GET_RETRY_BASE)).await;
            }
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| ErrorKind::Api(e.to_string()).into());
                }
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("server error {}", response.status());
                }
                Ok(response) => {
                    return Err(ErrorKind::Api(format!(
                        "unexpected status {} for {}",
                        response.status(),
                        url
                    ))
                    .into());
                }
                Err(e) => last_error = e.to_string(),
            }
            debug!("Mine API: retrying {}: {}", url, last_error);
        }
        Err(ErrorKind::Api(last_error).into())
    }

    async fn post(&self, url: &str) -> Result<reqwest::Response, String> {
        self.http.post(url).send().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl hal::MineApi for MineClient {
    async fn fetch_challenge(&self) -> error::Result<api::ChallengeStatus> {
        self.get_json(&format!("{}/challenge", self.base)).await
    }

    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> api::Submit {
        let url = format!(
            "{}/solution/{}/{}/{}",
            self.base, address, challenge_id, nonce
        );
        let response = match self.post(&url).await {
            Ok(response) => response,
            // network-level failures are worth a retry on a later tick
            Err(e) => return api::Submit::Transient(e),
        };
        match response.status() {
            status if status.is_success() => {
                // a receipt that fails to decode does not undo an accepted solution
                let receipt = response.json().await.unwrap_or_default();
                api::Submit::Accepted(receipt)
            }
            StatusCode::CONFLICT => api::Submit::Duplicate,
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                api::Submit::Transient(format!("submission failed with {}", status))
            }
            status => api::Submit::Fatal(format!("submission rejected with {}", status)),
        }
    }

    async fn terms(&self, version: &str) -> error::Result<api::Terms> {
        self.get_json(&format!("{}/TandC/{}", self.base, version))
            .await
    }

    async fn register(&self, address: &str, signature: &str, pubkey: &str) -> api::Register {
        let url = format!(
            "{}/register/{}/{}/{}",
            self.base, address, signature, pubkey
        );
        let response = match self.post(&url).await {
            Ok(response) => response,
            Err(e) => return api::Register::Transient(e),
        };
        match response.status() {
            status if status.is_success() => {
                let receipt = response.json().await.unwrap_or_default();
                api::Register::Accepted(receipt)
            }
            StatusCode::CONFLICT => api::Register::Duplicate,
            status if status.is_server_error() => {
                api::Register::Transient(format!("registration failed with {}", status))
            }
            status => api::Register::Fatal(format!("registration rejected with {}", status)),
        }
    }

    async fn reward_rates(&self) -> error::Result<Vec<f64>> {
        self.get_json(&format!("{}/work_to_star_rate", self.base))
            .await
    }

    async fn donate_to(&self, destination: &str, original: &str, signature: &str) -> api::Donate {
        let url = format!(
            "{}/donate_to/{}/{}/{}",
            self.base, destination, original, signature
        );
        let response = match self.post(&url).await {
            Ok(response) => response,
            Err(e) => return api::Donate::Transient(e),
        };
        match response.status() {
            status if status.is_success() => {
                let receipt = response.json().await.unwrap_or_default();
                api::Donate::Accepted(receipt)
            }
            StatusCode::FORBIDDEN => api::Donate::WindowClosed,
            StatusCode::CONFLICT => api::Donate::Duplicate,
            status if status.is_server_error() => {
                api::Donate::Transient(format!("donation failed with {}", status))
            }
            status => api::Donate::Fatal(format!("donation rejected with {}", status)),
        }
    }
}

/// Donation address endpoint. The body is either a bare address or a JSON
/// object carrying an `address` field.
pub struct DonationClient {
    http: reqwest::Client,
    url: String,
}

impl DonationClient {
    pub fn new(url: &str, timeout: Duration) -> error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ErrorKind::Api(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[derive(serde::Deserialize)]
struct DonationBody {
    address: String,
}

#[async_trait]
impl hal::DonationSource for DonationClient {
    async fn fetch_address(&self) -> error::Result<String> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ErrorKind::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ErrorKind::Api(format!(
                "donation endpoint returned {}",
                response.status()
            ))
            .into());
        }
        let body = response
            .text()
            .await
            .map_err(|e| ErrorKind::Api(e.to_string()))?;
        let address = match serde_json::from_str::<DonationBody>(&body) {
            Ok(parsed) => parsed.address,
            Err(_) => body.trim().to_string(),
        };
        if address.is_empty() {
            return Err(ErrorKind::Api("donation endpoint returned no address".to_string()).into());
        }
        Ok(address)
    }
}
