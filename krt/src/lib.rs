//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod config;
mod debug;
pub mod error;
pub mod export;
pub mod import;
mod interface;
pub mod netlink;
pub mod rib;

use std::sync::Arc;
use std::time::Duration;

use krt_utils::southbound::RouteProtocolId;
use krt_utils::task::{IntervalTask, Task};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug_span};

use crate::config::Config;
use crate::error::Error;
use crate::export::ExportEngine;
use crate::import::ImportEngine;
use crate::netlink::KernelProvider;
use crate::rib::RibProvider;

// Handle over the running redistribution subsystem.
pub struct Master<P, R> {
    provider: Arc<P>,
    pub import: Arc<ImportEngine<P, R>>,
    pub export: Arc<ExportEngine<P, R>>,
    // Long-lived tasks; dropping the handles stops them.
    scanner: Option<IntervalTask>,
    consumer: Option<Task<()>>,
}

// ===== impl Master =====

impl<P, R> Master<P, R>
where
    P: KernelProvider,
    R: RibProvider,
{
    // Re-expands interface selectors, swaps both engines' rule sets, and
    // re-evaluates the whole RIB against the new rules.
    pub async fn reconfigure(&self, config: &Config) {
        let links = match self.provider.links().await {
            Ok(links) => links,
            Err(error) => {
                error.log();
                Vec::new()
            }
        };
        self.import
            .replace_rules(config::import_rules(config, &links));
        self.export
            .reconfigure(
                config::export_rules(config),
                config::vrf_bindings(config),
            )
            .await;
        self.import.rescan().await;
    }

    // Immediate interface re-scan, for VRF lifecycle events.
    pub async fn rescan(&self) {
        self.import.rescan().await;
    }

    // Stops both engines. With `flush`, every exported route is removed
    // from the kernel before returning.
    pub async fn stop(mut self, flush: bool) {
        self.scanner = None;
        self.consumer = None;
        if flush {
            self.export.flush().await;
        }
    }
}

// ===== global functions =====

// Starts the redistribution subsystem. Startup cleanup completes before
// the first subscription message is consumed.
pub async fn start<P, R>(
    config: &Config,
    provider: Arc<P>,
    rib: Arc<R>,
) -> Result<Master<P, R>, Error>
where
    P: KernelProvider,
    R: RibProvider,
{
    let links = provider.links().await?;

    let import = Arc::new(ImportEngine::new(
        provider.clone(),
        rib.clone(),
        config::import_rules(config, &links),
    ));
    let export = ExportEngine::new(
        provider.clone(),
        rib.clone(),
        RouteProtocolId(config.export.route_protocol),
        Duration::from_millis(config.export.dampening_interval),
        config::export_rules(config),
        config::vrf_bindings(config),
    )?;

    let mut master = Master {
        provider,
        import,
        export,
        scanner: None,
        consumer: None,
    };

    if config.export.enabled {
        master.export.cleanup_stale_routes().await;
        master.export.resolve_bindings().await;

        // Consume best-path updates until the stream closes. The consumer
        // is supervised so a panic on one update cannot take down the
        // export plane.
        let engine = master.export.clone();
        let updates = Arc::new(AsyncMutex::new(rib.subscribe_best_paths()));
        master.consumer = Some(Task::spawn_supervised(move || {
            let engine = engine.clone();
            let updates = updates.clone();
            async move {
                let mut updates = updates.lock().await;
                while let Some(path) = updates.recv().await {
                    engine.process_update(path).await;
                }
            }
            .instrument(debug_span!("export"))
        }));
    }

    let import_enabled = config.import.enabled
        || config.vrfs.iter().any(|vrf| vrf.netlink_import.enabled);
    if import_enabled {
        master
            .import
            .rescan()
            .instrument(debug_span!("import"))
            .await;

        let engine = master.import.clone();
        master.scanner = Some(IntervalTask::new(
            Duration::from_secs(config.import.scan_interval),
            false,
            move || {
                let engine = engine.clone();
                async move { engine.rescan().await }
                    .instrument(debug_span!("import"))
            },
        ));
    }

    Ok(master)
}
