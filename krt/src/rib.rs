//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;

use krt_utils::bgp::Path;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::Error;

// Capability the redistribution engines consume from the BGP daemon's RIB.
//
// Paths submitted through this interface are attributed to the
// redistribution subsystem; resubmitting an identical path is a no-op at
// the RIB layer.
pub trait RibProvider: Send + Sync + 'static {
    // Inserts paths into the named table. The empty string denotes the
    // global table; paths with the withdraw flag set remove their
    // counterpart instead.
    fn add_paths(
        &self,
        vrf: &str,
        paths: Vec<Path>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    // Snapshot of the current best paths across all tables.
    fn enumerate_paths(
        &self,
    ) -> impl Future<Output = Result<Vec<Path>, Error>> + Send;

    // Stream of best-path updates. Updates for a single prefix arrive in
    // order; the stream is single-consumer.
    fn subscribe_best_paths(&self) -> UnboundedReceiver<Path>;
}
