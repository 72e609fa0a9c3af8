// Copyright (C) 2025-present The NetGauze Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use netgauze_netconf_operator::{
    config::OperatorConfig, reconciler::Reconciler, ssh::SshDialer, status::MemoryStatusStore,
};
use std::{env, path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let level = Level::from_str(level).with_context(|| format!("invalid logging level `{level}`"))?;
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        anyhow::bail!("Usage: {} <config-file>", args[0]);
    }
    let config_file = PathBuf::from(&args[1]);
    let config = OperatorConfig::load(&config_file)
        .with_context(|| format!("parsing config file {} failed", config_file.display()))?;
    init_tracing(&config.logging.level)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // all CPU cores are used when the number of threads is not configured
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    runtime.block_on(async move {
        let store = Arc::new(MemoryStatusStore::new());
        for resource in &config.resources {
            store.declare(resource.kind(), &resource.key()).await;
        }
        let dialer = Arc::new(SshDialer::new(Arc::new(russh::client::Config::default())));
        let reconciler = Reconciler::new(dialer, store.clone(), config.defaults.clone());

        let events = reconciler.events().subscribe();
        let events_handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                info!(
                    "[{}] {} at {}: {}",
                    event.owner, event.reason, event.received_at, event.payload
                );
            }
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Termination signal received before all resources were reconciled");
            }
            abandoned = reconciler.reconcile_all(&config.resources) => {
                for key in &abandoned {
                    warn!("[{key}] Resource was not reconciled");
                }
                for (kind, key, record) in store.snapshot().await {
                    info!(
                        "[{key}] {kind}: {}",
                        record.status.map_or_else(|| "unset".to_string(), |s| s.to_string())
                    );
                }
                let mut check = tokio::time::interval(
                    config.defaults.requeue_delay.max(Duration::from_secs(1)),
                );
                check.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        signal = tokio::signal::ctrl_c() => {
                            signal?;
                            break;
                        }
                        _ = check.tick() => {
                            for key in reconciler.recover_subscriptions(&config.resources).await {
                                warn!("[{key}] Resource was not recovered");
                            }
                        }
                    }
                }
                info!("Termination signal received, releasing resources");
            }
        }
        reconciler.delete_all(&config.resources).await;
        events_handle.abort();
        Ok::<(), anyhow::Error>(())
    })
}
