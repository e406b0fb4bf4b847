/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::clap_app;
use log::{info, LevelFilter};

use pccs_cache::cache::{CollateralBundle, Collaborators};
use pccs_cache::selector::PckCertSelector;
use pccs_cache::store::MemoryStore;
use pccs_cache::{CollateralCache, CollateralStore, Config, RefreshScheduler, RefreshScope};

#[cfg(feature = "link")]
fn default_selector() -> Arc<dyn PckCertSelector> {
    Arc::new(pccs_cache::selector::NativeSelector)
}

#[cfg(not(feature = "link"))]
fn default_selector() -> Arc<dyn PckCertSelector> {
    Arc::new(pccs_cache::selector::TcbOrderSelector::new())
}

fn build_cache(config: &Config) -> Result<CollateralCache> {
    let store: Arc<dyn CollateralStore> = match &config.store_file {
        Some(path) => Arc::new(
            MemoryStore::with_snapshot_file(path)
                .with_context(|| format!("Unable to open store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let upstream = config
        .upstream
        .client_builder()?
        .build(pccs_cache::reqwest_client(config.upstream.request_timeout()));
    let env = Collaborators {
        store,
        upstream: Arc::new(upstream),
        selector: default_selector(),
        root_ca_crl_url: config.root_ca_crl_url.clone(),
    };
    Ok(CollateralCache::new(env, config.caching_mode.policy()))
}

fn main() -> Result<()> {
    let matches = clap_app!(("pccs-cache") =>
        (author: "Fortanix")
        (about: "Caching proxy for Intel SGX/TDX attestation collateral")
        (@arg CONFIG: -c --config +takes_value "Configuration file (TOML)")
        (@arg VERBOSE: -v --verbose "Log progress information")
        (@subcommand daemon =>
            (about: "Keep the cache refreshed on the configured schedule")
        )
        (@subcommand refresh =>
            (about: "Refresh the cache now")
            (@arg CERTS: --certs "Refresh platform certificates instead of collateral")
            (@arg FMSPC: --fmspc +takes_value +multiple requires("CERTS") "Only refresh platforms with this fmspc")
        )
        (@subcommand upload =>
            (about: "Import a collateral bundle (JSON)")
            (@arg FILE: --file +takes_value +required "Bundle file")
        )
        (@subcommand registrations =>
            (about: "List queued platform registrations as JSON lines")
            (@arg MARK: --mark "Mark the listed registrations as collected")
        )
    )
    .get_matches();

    let mut logger = env_logger::Builder::from_default_env();
    let logger = logger.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    if matches.is_present("VERBOSE") {
        logger.filter_level(LevelFilter::Info).init();
    } else {
        logger.filter_level(LevelFilter::Warn).init();
    }

    let config = match matches.value_of("CONFIG") {
        Some(path) => Config::load(path).context("Unable to load configuration")?,
        None => Config::default(),
    };
    let cache = build_cache(&config)?;

    match matches.subcommand() {
        ("daemon", _) => {
            let schedule = config.schedule()?;
            info!("Starting in {:?} mode, refreshing on `{}`", config.caching_mode, config.refresh_schedule);
            let _scheduler = RefreshScheduler::start(cache.refresh_engine(), schedule, RefreshScope::Collateral);
            loop {
                thread::park();
            }
        }
        ("refresh", Some(args)) => {
            let scope = if args.is_present("CERTS") {
                RefreshScope::Certificates {
                    fmspcs: args.values_of("FMSPC").map(|f| f.map(String::from).collect()),
                }
            } else {
                RefreshScope::Collateral
            };
            cache.refresh_engine().refresh(&scope).context("Refresh failed")?;
        }
        ("upload", Some(args)) => {
            let file = args.value_of("FILE").expect("required argument");
            let content = fs::read(file).with_context(|| format!("Unable to read {}", file))?;
            let bundle: CollateralBundle = serde_json::from_slice(&content).context("Unable to parse bundle")?;
            let report = cache.upload_platform_collateral(&bundle).context("Upload failed")?;
            println!("Uploaded {} platforms, {} raw TCBs resolved", report.platforms, report.resolved);
            for (key, raw_tcb) in report.unresolved {
                println!("  unresolved: {} {}", key, raw_tcb);
            }
        }
        ("registrations", Some(args)) => {
            let pending = cache.pending_registrations()?;
            for registration in &pending {
                println!("{}", serde_json::to_string(registration)?);
            }
            if args.is_present("MARK") {
                let keys: Vec<_> = pending.iter().map(|r| (r.key.clone(), r.raw_tcb.clone())).collect();
                let marked = cache.mark_registrations_collected(&keys)?;
                info!("Marked {} registrations as collected", marked);
            }
        }
        _ => {
            eprintln!("{}", matches.usage());
            std::process::exit(2);
        }
    }
    Ok(())
}
