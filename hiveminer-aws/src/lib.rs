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

//! AWS backend of the hiveminer coordinator: S3 object store, IMDSv2 worker
//! identity and EC2 fleet control, plus the worker and controller binaries

pub mod deploy;
pub mod ec2;
pub mod imds;
pub mod s3;

use hiveminer::error::{self, ErrorKind};

pub use ec2::Ec2Compute;
pub use imds::ImdsMetadata;
pub use s3::{bucket_name, S3Store};

/// Account id of the ambient credentials; part of the bucket name
pub async fn account_id(region: Option<String>) -> error::Result<String> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }
    let shared_config = loader.load().await;
    let client = aws_sdk_sts::Client::new(&shared_config);
    let identity = client.get_caller_identity().send().await.map_err(|err| {
        ErrorKind::Metadata(format!(
            "caller identity: {}",
            aws_sdk_sts::error::DisplayErrorContext(err)
        ))
    })?;
    identity
        .account()
        .map(|account| account.to_string())
        .ok_or_else(|| ErrorKind::Metadata("caller identity without account id".to_string()).into())
}
