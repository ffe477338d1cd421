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

//! EC2 implementation of the compute-provider capability: fleet discovery by
//! tag plus the operator actions (launch, scale, terminate)

use hiveminer_logging::macros::*;

use hiveminer::error::{self, ErrorKind};
use hiveminer::hal::{ComputeProvider, WorkerInstance};

use async_trait::async_trait;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use aws_sdk_ec2::Client;
use chrono::{DateTime, Utc};

/// Tag key marking instances of one hiveminer fleet
pub const FLEET_TAG_KEY: &str = "hiveminer-fleet";

pub struct Ec2Compute {
    client: Client,
    /// Value of the fleet tag; one tag value per regional fleet
    fleet_tag: String,
    /// Launch template all workers are started from
    launch_template: Option<String>,
}

impl Ec2Compute {
    pub fn new(client: Client, fleet_tag: String, launch_template: Option<String>) -> Self {
        Self {
            client,
            fleet_tag,
            launch_template,
        }
    }

    pub async fn connect(
        region: Option<String>,
        fleet_tag: String,
        launch_template: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;
        Self::new(Client::new(&shared_config), fleet_tag, launch_template)
    }

    fn fleet_filter(&self) -> Filter {
        Filter::builder()
            .name(format!("tag:{}", FLEET_TAG_KEY))
            .values(&self.fleet_tag)
            .build()
    }

    fn live_state_filter() -> Filter {
        Filter::builder()
            .name("instance-state-name")
            .values("pending")
            .values("running")
            .build()
    }
}

fn launch_time_of(instance: &aws_sdk_ec2::types::Instance) -> Option<DateTime<Utc>> {
    instance
        .launch_time()
        .and_then(|time| DateTime::<Utc>::from_timestamp(time.secs(), time.subsec_nanos()))
}

#[async_trait]
impl ComputeProvider for Ec2Compute {
    async fn list_workers(&self) -> error::Result<Vec<WorkerInstance>> {
        let mut workers = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .describe_instances()
                .filters(self.fleet_filter())
                .filters(Self::live_state_filter())
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|err| {
                    ErrorKind::Compute(format!(
                        "describe instances: {}",
                        DisplayErrorContext(err)
                    ))
                })?;

            for reservation in output.reservations() {
                for instance in reservation.instances() {
                    let id = match instance.instance_id() {
                        Some(id) => id.to_string(),
                        None => continue,
                    };
                    workers.push(WorkerInstance {
                        id,
                        public_endpoint: instance
                            .public_dns_name()
                            .filter(|name| !name.is_empty())
                            .map(|name| name.to_string()),
                        launched_at: launch_time_of(instance),
                    });
                }
            }

            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }
        Ok(workers)
    }

    async fn launch_workers(&self, count: usize) -> error::Result<Vec<String>> {
        let launch_template = self.launch_template.as_ref().ok_or_else(|| {
            error::Error::from(ErrorKind::Compute(
                "no launch template configured".to_string(),
            ))
        })?;

        let output = self
            .client
            .run_instances()
            .launch_template(
                aws_sdk_ec2::types::LaunchTemplateSpecification::builder()
                    .launch_template_name(launch_template)
                    .build(),
            )
            .min_count(count as i32)
            .max_count(count as i32)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(
                        Tag::builder()
                            .key(FLEET_TAG_KEY)
                            .value(&self.fleet_tag)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                ErrorKind::Compute(format!("run instances: {}", DisplayErrorContext(err)))
            })?;

        let ids: Vec<String> = output
            .instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(|id| id.to_string()))
            .collect();
        info!("Compute: launched {:?}", ids);
        Ok(ids)
    }

    /// Converge on a desired worker count; extra instances are terminated
    /// newest first so long-lived address assignments survive
    async fn set_desired_count(&self, count: usize) -> error::Result<()> {
        let mut current = self.list_workers().await?;
        if current.len() < count {
            self.launch_workers(count - current.len()).await?;
        } else if current.len() > count {
            current.sort_by(|a, b| a.launched_at.cmp(&b.launched_at));
            let victims: Vec<String> = current
                .drain(count..)
                .map(|instance| instance.id)
                .collect();
            self.terminate_workers(&victims).await?;
        }
        Ok(())
    }

    async fn terminate_workers(&self, ids: &[String]) -> error::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|err| {
                ErrorKind::Compute(format!(
                    "terminate instances: {}",
                    DisplayErrorContext(err)
                ))
            })?;
        info!("Compute: terminated {:?}", ids);
        Ok(())
    }
}
