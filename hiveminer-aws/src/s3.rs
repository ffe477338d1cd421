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

//! S3 implementation of the object store capability. Conditional writes map
//! onto `If-Match` / `If-None-Match` preconditions; a 412 (or the 409 S3
//! answers to concurrent conditional writes) surfaces as a lost race.

use hiveminer::error::{self, ErrorKind};
use hiveminer::hal::{CasOutcome, Object, ObjectMeta, ObjectStore, Precondition};

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use std::collections::HashMap;

/// Regional bucket naming; the account-qualified form is the canonical one
pub fn bucket_name(prefix: &str, account_id: &str, region: &str) -> String {
    format!("{}-{}-{}", prefix, account_id, region)
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn store_err<E>(operation: &str, key: &str, err: SdkError<E>) -> error::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    ErrorKind::Store(format!(
        "{} {}: {}",
        operation,
        key,
        DisplayErrorContext(err)
    ))
    .into()
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a store from the ambient AWS environment (instance profile or
    /// operator credentials)
    pub async fn connect(bucket: String, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;
        Self::new(Client::new(&shared_config), bucket)
    }

    #[inline]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> error::Result<Option<Object>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if status_of(&err) == Some(404) {
                    return Ok(None);
                }
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Ok(None);
                }
                return Err(ErrorKind::Store(format!("get {}: {}", key, service)))?;
            }
        };

        let etag = output.e_tag().unwrap_or_default().to_string();
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ErrorKind::Store(format!("get {}: body: {}", key, e)))?
            .into_bytes()
            .to_vec();
        Ok(Some(Object { body, etag }))
    }

    async fn head(&self, key: &str) -> error::Result<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                etag: output.e_tag().unwrap_or_default().to_string(),
                metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) => {
                if status_of(&err) == Some(404) {
                    return Ok(None);
                }
                let service = err.into_service_error();
                if service.is_not_found() {
                    return Ok(None);
                }
                Err(ErrorKind::Store(format!("head {}: {}", key, service)))?
            }
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> error::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| store_err("put", key, err))?;
        Ok(())
    }

    async fn put_with_metadata(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> error::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|err| store_err("put", key, err))?;
        Ok(())
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> error::Result<CasOutcome> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));
        request = match &precondition {
            Precondition::IfMatch(etag) => request.if_match(etag),
            Precondition::IfAbsent => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(CasOutcome::Committed),
            // 412: precondition failed; 409: concurrent conditional writes
            Err(err) if matches!(status_of(&err), Some(412) | Some(409)) => {
                Ok(CasOutcome::PreconditionFailed)
            }
            Err(err) => Err(store_err("conditional put", key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.clone())
                .send()
                .await
                .map_err(|err| store_err("list", prefix, err))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            continuation_token = output.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> error::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| store_err("delete", key, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bucket_name_is_account_qualified() {
        assert_eq!(
            bucket_name("hiveminer", "123456789012", "eu-west-1"),
            "hiveminer-123456789012-eu-west-1"
        );
    }
}
