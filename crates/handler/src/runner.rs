//! One fetch-and-publish cycle, and the state it runs over.
//!
//! The runner owns the per-resource connections, the fetcher and the
//! query vector. Overlapping cycles are excluded by a try-lock on the
//! connection table: a tick that fires while a cycle is running (or while
//! a manual republish is in flight) is dropped with a warning, never
//! queued.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use psych_metadata::Config;

use crate::error::FetchError;
use crate::fetch::{Connection, Fetcher, FetchFlags};
use crate::mapper::{self, QueryVector};
use crate::metrics;
use crate::provider::Provider;

pub struct Runner {
    config: Arc<Config>,
    provider: Arc<Provider>,
    fetcher: Fetcher,
    query_vector: QueryVector,
    /// Holds the per-cycle state and doubles as the cycle-busy flag.
    connections: Mutex<Vec<Connection>>,
}

impl Runner {
    /// Build the per-resource connections and resolve every configured
    /// item into its (deduplicated, process-wide) item stream.
    pub fn build(config: Arc<Config>, provider: Arc<Provider>) -> Result<Self, FetchError> {
        let fetcher = Fetcher::new(&config.knobs)?;
        let query_vector = QueryVector::build(&provider, &config.resources);
        let connections = config
            .resources
            .iter()
            .map(|resource| Connection::new(Arc::new(resource.clone())))
            .collect();
        Ok(Self {
            config,
            provider,
            fetcher,
            query_vector,
            connections: Mutex::new(connections),
        })
    }

    pub fn query_vector(&self) -> &QueryVector {
        &self.query_vector
    }

    /// Run one cycle, or drop it when another is still in flight.
    /// Returns the number of bulletins accepted this cycle.
    pub async fn run_cycle(&self, flags: FetchFlags) -> usize {
        let mut connections = match self.connections.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("periodic refresh aborted due to running query");
                metrics::inc_tick_skipped();
                return 0;
            }
        };

        let provider = &self.provider;
        let config = &self.config;
        let query_vector = &self.query_vector;
        self.fetcher
            .run_cycle(&mut connections, flags, |resource, bulletin| {
                mapper::send_refresh(provider, config, resource, &bulletin, query_vector);
            })
            .await
    }
}
