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

//! Operator controller: seeds the registry, distributes the miner code and
//! drives the fleet size. Stateless between invocations; everything durable
//! lives in the regional bucket.

use hiveminer_config::{clap, Configuration};
use hiveminer_logging::macros::*;

use hiveminer::api::client::MineClient;
use hiveminer::error::{self, ErrorKind};
use hiveminer::hal::{ComputeProvider, MineApi, Signer, SystemClock};
use hiveminer::registry::RegistryStore;
use hiveminer::signer::ToolSigner;
use hiveminer::stats::StatsLedger;
use hiveminer::work::{attempts_log2, difficulty_bits};
use hiveminer::{api, challenges};

use hiveminer_aws::{account_id, bucket_name, deploy, Ec2Compute, S3Store};

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let app = Configuration::add_args(
        clap::App::new("hivectl")
            .version(clap::crate_version!())
            .setting(clap::AppSettings::SubcommandRequiredElseHelp),
    )
    .subcommand(
        clap::SubCommand::with_name("seed")
            .about("Seed or refresh the address registry")
            .arg(
                clap::Arg::with_name("addresses-file")
                    .long("addresses-file")
                    .takes_value(true)
                    .required(true)
                    .help("File with one address per line"),
            )
            .arg(
                clap::Arg::with_name("addresses-per-instance")
                    .long("addresses-per-instance")
                    .takes_value(true)
                    .help("Slice size per worker; default from the config file"),
            ),
    )
    .subcommand(
        clap::SubCommand::with_name("deploy")
            .about("Upload the miner-code archive")
            .arg(
                clap::Arg::with_name("archive")
                    .long("archive")
                    .takes_value(true)
                    .required(true),
            ),
    )
    .subcommand(
        clap::SubCommand::with_name("launch")
            .about("Launch additional workers")
            .arg(
                clap::Arg::with_name("count")
                    .long("count")
                    .takes_value(true)
                    .required(true),
            ),
    )
    .subcommand(
        clap::SubCommand::with_name("scale")
            .about("Converge on a desired worker count")
            .arg(
                clap::Arg::with_name("count")
                    .long("count")
                    .takes_value(true)
                    .required(true),
            ),
    )
    .subcommand(
        clap::SubCommand::with_name("terminate")
            .about("Terminate workers")
            .arg(
                clap::Arg::with_name("ids")
                    .long("ids")
                    .takes_value(true)
                    .help("Comma separated instance ids"),
            )
            .arg(
                clap::Arg::with_name("all")
                    .long("all")
                    .help("Terminate the whole regional fleet"),
            ),
    )
    .subcommand(clap::SubCommand::with_name("status").about("Fleet and mining status"))
    .subcommand(
        clap::SubCommand::with_name("register")
            .about("Register addresses against the terms of service")
            .arg(
                clap::Arg::with_name("addresses-file")
                    .long("addresses-file")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                clap::Arg::with_name("terms-version")
                    .long("terms-version")
                    .takes_value(true),
            ),
    )
    .subcommand(
        clap::SubCommand::with_name("donate")
            .about("Transfer rewards of an address to a donation destination")
            .arg(
                clap::Arg::with_name("destination")
                    .long("destination")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                clap::Arg::with_name("original")
                    .long("original")
                    .takes_value(true)
                    .required(true),
            ),
    );

    let matches = app.get_matches();
    hiveminer_logging::setup();

    let code = match run(&matches).await {
        Ok(()) => 0,
        Err(e) => {
            error!("hivectl: {}", e);
            1
        }
    };
    std::process::exit(code);
}

struct Context {
    config: Configuration,
    region: String,
    store: Arc<S3Store>,
    clock: Arc<SystemClock>,
}

impl Context {
    async fn build(matches: &clap::ArgMatches<'_>) -> error::Result<Self> {
        let config = Configuration::parse(matches)
            .map_err(|e| error::Error::from(ErrorKind::Config(e.to_string())))?;
        let region = config.region.clone().ok_or_else(|| {
            error::Error::from(ErrorKind::Config(
                "region is required (config file or --region)".to_string(),
            ))
        })?;
        let account = account_id(Some(region.clone())).await?;
        let bucket = bucket_name(&config.bucket_prefix, &account, &region);
        info!("hivectl: bucket {}", bucket);
        let store = Arc::new(S3Store::connect(bucket, Some(region.clone())).await);
        Ok(Self {
            config,
            region,
            store,
            clock: Arc::new(SystemClock),
        })
    }

    fn registry(&self) -> RegistryStore {
        RegistryStore::new(self.store.clone(), self.clock.clone())
    }

    async fn compute(&self) -> Ec2Compute {
        let fleet_tag = self
            .config
            .fleet
            .fleet_tag
            .clone()
            .unwrap_or_else(|| self.config.bucket_prefix.clone());
        Ec2Compute::connect(
            Some(self.region.clone()),
            fleet_tag,
            self.config.fleet.launch_template.clone(),
        )
        .await
    }

    fn mine_api(&self) -> error::Result<MineClient> {
        MineClient::new(
            &self.config.api.base_url,
            Duration::from_secs(self.config.api.timeout_secs),
        )
    }
}

fn read_addresses(path: &Path) -> error::Result<Vec<String>> {
    let raw = fs::read_to_string(path)?;
    let addresses: Vec<String> = raw
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect();
    if addresses.is_empty() {
        return Err(ErrorKind::Config(format!("{:?} holds no addresses", path)))?;
    }
    Ok(addresses)
}

fn parse_count(matches: &clap::ArgMatches<'_>) -> error::Result<usize> {
    matches
        .value_of("count")
        .expect("BUG: count is a required argument")
        .parse::<usize>()
        .map_err(|_| ErrorKind::Config("count is not a number".to_string()).into())
}

async fn run(matches: &clap::ArgMatches<'_>) -> error::Result<()> {
    let context = Context::build(matches).await?;

    match matches.subcommand() {
        ("seed", Some(sub)) => {
            let addresses =
                read_addresses(Path::new(sub.value_of("addresses-file").unwrap()))?;
            let per_instance = match sub.value_of("addresses-per-instance") {
                Some(value) => value.parse::<usize>().map_err(|_| {
                    error::Error::from(ErrorKind::Config(
                        "addresses-per-instance is not a number".to_string(),
                    ))
                })?,
                None => context.config.mining.addresses_per_instance,
            };
            let registry = context.registry().seed(addresses, per_instance).await?;
            println!(
                "seeded {} addresses, {} per instance, {} live assignments kept",
                registry.addresses.len(),
                registry.addresses_per_instance,
                registry.assignments.len()
            );
        }
        ("deploy", Some(sub)) => {
            let archive = Path::new(sub.value_of("archive").unwrap());
            let checksum = deploy::upload_miner_code(
                context.store.as_ref(),
                context.clock.as_ref(),
                archive,
            )
            .await?;
            println!("deployed {} ({})", deploy::MINER_CODE_KEY, checksum);
        }
        ("launch", Some(sub)) => {
            let ids = context.compute().await.launch_workers(parse_count(sub)?).await?;
            println!("launched {}", ids.join(", "));
        }
        ("scale", Some(sub)) => {
            let count = parse_count(sub)?;
            context.compute().await.set_desired_count(count).await?;
            println!("fleet converging on {} workers", count);
        }
        ("terminate", Some(sub)) => {
            let compute = context.compute().await;
            let ids: Vec<String> = if sub.is_present("all") {
                compute
                    .list_workers()
                    .await?
                    .into_iter()
                    .map(|instance| instance.id)
                    .collect()
            } else {
                sub.value_of("ids")
                    .unwrap_or_default()
                    .split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            };
            if ids.is_empty() {
                return Err(ErrorKind::Config(
                    "nothing to terminate; pass --ids or --all".to_string(),
                ))?;
            }
            compute.terminate_workers(&ids).await?;
            println!("terminated {}", ids.join(", "));
        }
        ("status", _) => {
            status(&context).await?;
        }
        ("register", Some(sub)) => {
            let addresses =
                read_addresses(Path::new(sub.value_of("addresses-file").unwrap()))?;
            let terms_version = sub
                .value_of("terms-version")
                .map(|version| version.to_string())
                .or_else(|| context.config.api.terms_version.clone())
                .ok_or_else(|| {
                    error::Error::from(ErrorKind::Config(
                        "terms version is required (config file or --terms-version)".to_string(),
                    ))
                })?;
            let api = Arc::new(context.mine_api()?);
            let signer = Arc::new(ToolSigner::new(
                context.config.mining.signer_binary.clone(),
            ));
            let summary = hiveminer::register::Registrar::new(api, signer)
                .register_addresses(&terms_version, &addresses)
                .await?;
            println!(
                "registered {}, already known {}, failed {}",
                summary.registered, summary.duplicates, summary.failed
            );
        }
        ("donate", Some(sub)) => {
            let destination = sub.value_of("destination").unwrap();
            let original = sub.value_of("original").unwrap();
            let api = context.mine_api()?;
            let signer = ToolSigner::new(context.config.mining.signer_binary.clone());
            let signature = signer.sign(original, destination).await?;
            match api
                .donate_to(destination, original, &signature.signature)
                .await
            {
                api::Donate::Accepted(_) => println!("donation accepted"),
                api::Donate::WindowClosed => println!("donation window not open yet"),
                api::Donate::Duplicate => println!("donation already transferred"),
                api::Donate::Transient(message) | api::Donate::Fatal(message) => {
                    return Err(ErrorKind::Api(message))?;
                }
            }
        }
        (command, _) => {
            return Err(ErrorKind::Config(format!("unknown command {}", command)))?;
        }
    }
    Ok(())
}

async fn status(context: &Context) -> error::Result<()> {
    match context.registry().load().await? {
        Some((registry, _)) => {
            println!(
                "registry: {} addresses, cursor {}, {} live assignments",
                registry.addresses.len(),
                registry.next_available,
                registry.assignments.len()
            );
            let mut assignments: Vec<_> = registry.assignments.values().collect();
            assignments.sort_by_key(|assignment| assignment.start_address);
            for assignment in assignments {
                println!(
                    "  {}: [{}, {}] last heartbeat {:?}",
                    assignment.worker_id,
                    assignment.start_address,
                    assignment.end_address,
                    assignment.last_heartbeat
                );
            }
        }
        None => println!("registry: not seeded"),
    }

    let ledger = challenges::ChallengeLedger::new(
        context.store.clone(),
        context.clock.clone(),
        context.region.clone(),
    );
    let open = ledger.open_challenges().await?;
    println!("challenges: {} open", open.len());
    for challenge in &open {
        println!(
            "  {}: {} difficulty bits (~2^{} attempts/solution), closes {}",
            challenge.challenge_id,
            difficulty_bits(&challenge.difficulty),
            attempts_log2(&challenge.difficulty),
            challenge.latest_submission
        );
    }

    let stats = StatsLedger::new(context.store.clone(), context.clock.clone())
        .load()
        .await?;
    println!(
        "stats: {} solutions ({} donated), {} errors, updated {}",
        stats.total_solutions, stats.donation_solutions, stats.total_errors, stats.last_updated
    );
    for recent_error in stats.recent_errors.iter().take(5) {
        println!(
            "  recent error: {} ({:?}/{:?})",
            recent_error.message, recent_error.address, recent_error.challenge_id
        );
    }

    match context.mine_api() {
        Ok(api) => match api.reward_rates().await {
            Ok(rates) => {
                if let Some(current) = rates.last() {
                    println!("reward per solution: {} (history of {})", current, rates.len());
                }
            }
            Err(e) => warn!("hivectl: reward rates unavailable: {}", e),
        },
        Err(e) => warn!("hivectl: Mine API unavailable: {}", e),
    }
    Ok(())
}
