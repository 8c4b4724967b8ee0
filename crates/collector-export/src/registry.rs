//! Set of known mediator destinations, keyed by id.

use std::collections::BTreeMap;
use std::time::Duration;

use export_buffer::{BufferConfig, DestinationId, Framing};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::destination::{ConnectAttempt, ConnectionState, Destination, DestinationConfig};
use crate::{ExportError, ExportResult, DEFAULT_FLUSH_BUDGET};

/// Result of announcing a mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New destination
    Added,
    /// Known destination at a new endpoint
    Moved,
    /// Known destination, same endpoint
    Unchanged,
}

/// Ordered collection of destinations.
#[derive(Debug)]
pub struct DestinationRegistry {
    destinations: BTreeMap<DestinationId, Destination>,
    framing: Framing,
    buffer: BufferConfig,
    flush_budget: usize,
}

impl DestinationRegistry {
    /// Create an empty registry. New destinations get backlogs with the
    /// given framing and sizing.
    pub fn new(framing: Framing, buffer: BufferConfig) -> Self {
        Self {
            destinations: BTreeMap::new(),
            framing,
            buffer,
            flush_budget: DEFAULT_FLUSH_BUDGET,
        }
    }

    /// Backlog bytes each destination writes per flush.
    pub fn with_flush_budget(mut self, budget: usize) -> Self {
        self.flush_budget = budget;
        for dest in self.destinations.values_mut() {
            dest.set_flush_budget(budget);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.values()
    }

    pub fn get(&self, id: DestinationId) -> Option<&Destination> {
        self.destinations.get(&id)
    }

    /// Find the destination a record is routed to.
    pub fn lookup(&mut self, id: DestinationId) -> ExportResult<&mut Destination> {
        self.destinations
            .get_mut(&id)
            .ok_or(ExportError::UnknownDestination(id))
    }

    /// Add a destination or update its endpoint, without connecting.
    ///
    /// A moved destination is disconnected but keeps its backlog.
    pub fn upsert(&mut self, config: DestinationConfig) -> UpsertOutcome {
        if let Some(dest) = self.destinations.get_mut(&config.id) {
            return if dest.reconfigure(config) {
                UpsertOutcome::Moved
            } else {
                UpsertOutcome::Unchanged
            };
        }

        info!(
            dest_id = config.id,
            endpoint = %config.endpoint(),
            "Added mediator destination"
        );
        let id = config.id;
        let mut dest = Destination::new(config, self.framing, self.buffer.clone());
        dest.set_flush_budget(self.flush_budget);
        self.destinations.insert(id, dest);
        UpsertOutcome::Added
    }

    /// Remove a destination, closing its connection and discarding its
    /// backlog.
    pub fn remove(&mut self, id: DestinationId) -> Option<Destination> {
        let mut dest = self.destinations.remove(&id)?;
        dest.close();

        let discarded = dest.backlog().buffered();
        if discarded > 0 {
            warn!(
                dest_id = id,
                discarded_bytes = discarded,
                "Removed mediator destination with unsent backlog"
            );
        } else {
            info!(dest_id = id, "Removed mediator destination");
        }
        Some(dest)
    }

    /// Start a connect for one destination if it is disconnected.
    pub fn begin_connect(&mut self, id: DestinationId) -> Option<DestinationConfig> {
        self.destinations.get_mut(&id)?.begin_connect()
    }

    /// Start a connect for every disconnected destination.
    pub fn begin_reconnects(&mut self) -> Vec<DestinationConfig> {
        self.destinations
            .values_mut()
            .filter_map(Destination::begin_connect)
            .collect()
    }

    /// Hand a finished attempt to its destination.
    ///
    /// Results for a destination that has since been withdrawn or moved to
    /// another endpoint are discarded. Returns the destination's state when
    /// the result was applied.
    pub fn complete_connect(&mut self, attempt: ConnectAttempt) -> Option<ConnectionState> {
        let ConnectAttempt { config, result } = attempt;
        match self.destinations.get_mut(&config.id) {
            Some(dest) if dest.config() == &config => Some(dest.finish_connect(result)),
            _ => {
                debug!(
                    dest_id = config.id,
                    endpoint = %config.endpoint(),
                    "Discarding connect result for a stale endpoint"
                );
                None
            }
        }
    }

    /// Connect every disconnected destination concurrently and wait for
    /// all attempts to finish.
    ///
    /// Returns how many destinations are connected afterwards.
    pub async fn connect_all(&mut self, connect_timeout: Duration) -> usize {
        let started = self.begin_reconnects();
        let mut attempts = JoinSet::new();
        for config in started.iter().cloned() {
            attempts.spawn(ConnectAttempt::run(config, connect_timeout));
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(attempt) => {
                    self.complete_connect(attempt);
                }
                Err(e) => warn!(error = %e, "Connect task did not finish"),
            }
        }

        // A task that died never reported back
        for config in &started {
            if let Some(dest) = self.destinations.get_mut(&config.id) {
                dest.abandon_connect();
            }
        }

        let reachable = self.iter().filter(|d| d.is_connected()).count();
        debug!(
            reachable = reachable,
            total = self.destinations.len(),
            "Connected export destinations"
        );
        reachable
    }

    /// Flush one budget's worth of backlog on every connected destination.
    pub fn flush_all(&mut self) {
        for dest in self.destinations.values_mut() {
            dest.flush_backlog();
        }
    }

    /// Close every connection. Backlogs are kept.
    pub fn close_all(&mut self) {
        for dest in self.destinations.values_mut() {
            dest.close();
        }
    }
}
