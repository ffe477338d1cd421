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

//! Worker node entry point: reserve an address slice, then mine until told
//! otherwise. Exit codes: 0 clean shutdown, 1 fatal configuration or registry
//! error, 2 exhausted registry (operator has to add addresses or wait for the
//! reclaimer).

use hiveminer_config::{clap, Configuration};
use hiveminer_logging::macros::*;

use hiveminer::allocator::Allocator;
use hiveminer::api::client::{DonationClient, MineClient};
use hiveminer::error::ErrorKind;
use hiveminer::hal::{DonationSource, MetadataProvider, SystemClock};
use hiveminer::halt;
use hiveminer::hub::{Capabilities, Core};
use hiveminer::register::Registrar;
use hiveminer::registry::RegistryStore;
use hiveminer::signer::ToolSigner;

use hiveminer_aws::{account_id, bucket_name, deploy, Ec2Compute, ImdsMetadata, S3Store};

use tokio::signal::unix::{signal, SignalKind};

use std::sync::Arc;
use std::time::Duration;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_EXHAUSTED: i32 = 2;

#[tokio::main]
async fn main() {
    let app = Configuration::add_args(
        clap::App::new("hiveminer")
            .version(clap::crate_version!())
            .arg(
                clap::Arg::with_name("allocate-only")
                    .long("allocate-only")
                    .help("Reserve the address slice, print it on stdout and exit")
                    .required(false),
            )
            .arg(
                clap::Arg::with_name("skip-miner-code")
                    .long("skip-miner-code")
                    .help("Do not fetch the miner-code archive from the bucket")
                    .required(false),
            ),
    );
    let matches = app.get_matches();

    hiveminer_logging::setup();
    std::process::exit(run(&matches).await);
}

async fn run(matches: &clap::ArgMatches<'_>) -> i32 {
    let config = match Configuration::parse(matches) {
        Ok(config) => config,
        Err(e) => {
            error!("Worker: {}", e);
            return EXIT_FATAL;
        }
    };

    // identity comes from instance metadata; only the region is overridable
    let metadata = match ImdsMetadata::new() {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Worker: metadata client: {}", e);
            return EXIT_FATAL;
        }
    };
    let worker_id = match metadata.worker_id().await {
        Ok(worker_id) => worker_id,
        Err(e) => {
            error!("Worker: cannot determine worker id: {}", e);
            return EXIT_FATAL;
        }
    };
    let region = match &config.region {
        Some(region) => region.clone(),
        None => match metadata.region().await {
            Ok(region) => region,
            Err(e) => {
                error!("Worker: cannot determine region: {}", e);
                return EXIT_FATAL;
            }
        },
    };
    let public_endpoint = match metadata.public_endpoint().await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("Worker: no public endpoint: {}", e);
            None
        }
    };
    info!("Worker: {} in {}", worker_id, region);

    let account = match account_id(Some(region.clone())).await {
        Ok(account) => account,
        Err(e) => {
            error!("Worker: cannot resolve account id: {}", e);
            return EXIT_FATAL;
        }
    };
    let bucket = bucket_name(&config.bucket_prefix, &account, &region);
    let store = Arc::new(S3Store::connect(bucket, Some(region.clone())).await);
    let clock = Arc::new(SystemClock);

    if !matches.is_present("skip-miner-code") {
        // a missing archive is fine as long as the configured binary exists
        if let Err(e) = deploy::fetch_miner_code(store.as_ref(), &config.mining.cache_dir).await {
            warn!("Worker: miner code not refreshed: {}", e);
        }
    }
    if !config.mining.miner_binary.exists() {
        error!(
            "Worker: miner binary {:?} does not exist",
            config.mining.miner_binary
        );
        return EXIT_FATAL;
    }

    let allocator = Allocator::new(
        RegistryStore::new(store.clone(), clock.clone()),
        config.address_cache_path(),
        worker_id.clone(),
        public_endpoint.clone(),
        config.allocator_stale(),
    );
    let addresses = match allocator.allocate().await {
        Ok(addresses) => addresses,
        Err(e) => {
            return match e.kind() {
                ErrorKind::RegistryExhausted(_, _) => {
                    error!("Worker: {}; retry once addresses are available", e);
                    EXIT_EXHAUSTED
                }
                _ => {
                    error!("Worker: allocation failed: {}", e);
                    EXIT_FATAL
                }
            };
        }
    };

    if matches.is_present("allocate-only") {
        // consumed by the startup script
        println!(
            "{}",
            serde_json::to_string(&addresses).expect("BUG: addresses are not serializable")
        );
        return EXIT_OK;
    }

    let api = match MineClient::new(
        &config.api.base_url,
        Duration::from_secs(config.api.timeout_secs),
    ) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Worker: Mine API client: {}", e);
            return EXIT_FATAL;
        }
    };

    if let Some(terms_version) = &config.api.terms_version {
        let registrar = Registrar::new(
            api.clone(),
            Arc::new(ToolSigner::new(config.mining.signer_binary.clone())),
        );
        if let Err(e) = registrar.register_addresses(terms_version, &addresses).await {
            warn!("Worker: registration incomplete: {}", e);
        }
    }

    let donation = match &config.api.donation_url {
        Some(url) => match DonationClient::new(url, Duration::from_secs(config.api.timeout_secs)) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn DonationSource>),
            Err(e) => {
                warn!("Worker: donation source disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let fleet_tag = config
        .fleet
        .fleet_tag
        .clone()
        .unwrap_or_else(|| config.bucket_prefix.clone());
    let compute = Arc::new(
        Ec2Compute::connect(
            Some(region.clone()),
            fleet_tag,
            config.fleet.launch_template.clone(),
        )
        .await,
    );

    let core = Arc::new(Core::new(
        config,
        region,
        worker_id,
        public_endpoint,
        addresses,
        Capabilities {
            store,
            api,
            compute,
            clock,
            donation,
        },
    ));

    let (halt_sender, halt_receiver) = halt::make_pair();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Worker: cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Worker: SIGINT received"),
            _ = sigterm.recv() => info!("Worker: SIGTERM received"),
        }
        halt_sender.stop();
    });

    core.run(halt_receiver).await;
    EXIT_OK
}
