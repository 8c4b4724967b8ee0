//! The exporter event loop.
//!
//! One exporter runs on its own thread and is the only code that touches
//! mediator sockets and backlogs. It waits on three kinds of event:
//!
//! - a producer queue has messages: drain a batch and route each record
//! - the maintenance timer fired: check for shutdown, start connects for
//!   disconnected destinations and flush every backlog
//! - a connect attempt finished: hand the socket to its destination
//!
//! Connects run as separate tasks, so an unreachable mediator never holds
//! up the queues or the other destinations.
//!
//! Queues are polled round-robin from a rotating start so a busy producer
//! cannot starve the others.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use export_buffer::ExportRecord;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::destination::{ConnectAttempt, ConnectionState, Delivery, DestinationConfig};
use crate::message::{ExportMessage, ExportSender};
use crate::registry::{DestinationRegistry, UpsertOutcome};
use crate::{ExportError, ExportResult, ExporterConfig};

/// Name given to the exporter thread.
pub const EXPORTER_THREAD_NAME: &str = "li-exporter";

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub records_sent: u64,
    pub records_buffered: u64,
    pub records_dropped: u64,
    pub unknown_destination: u64,
    pub packets_released: u64,
    pub sources_failed: u64,
}

/// When the loop stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// Only when the halt flag is raised
    #[default]
    UntilHalted,
    /// Also once every queue is closed and every backlog is empty
    UntilDrained,
}

/// What woke the loop.
enum LoopEvent {
    Tick,
    Message { source: usize, message: ExportMessage },
    Closed { source: usize },
    Connected(ConnectAttempt),
}

struct Source {
    receiver: mpsc::Receiver<ExportMessage>,
    failed: bool,
}

/// Exporter state: destinations, producer queues and counters.
pub struct Exporter {
    config: ExporterConfig,
    registry: DestinationRegistry,
    sources: Vec<Source>,
    next_source: usize,
    connect_tx: mpsc::UnboundedSender<ConnectAttempt>,
    connect_rx: mpsc::UnboundedReceiver<ConnectAttempt>,
    exit_policy: ExitPolicy,
    stats: ExportStats,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Self {
        let registry = DestinationRegistry::new(config.framing, config.buffer.clone())
            .with_flush_budget(config.flush_budget);
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            sources: Vec::new(),
            next_source: 0,
            connect_tx,
            connect_rx,
            exit_policy: ExitPolicy::default(),
            stats: ExportStats::default(),
        }
    }

    /// Create an exporter that knows about `destinations` up front.
    pub fn with_destinations(
        config: ExporterConfig,
        destinations: impl IntoIterator<Item = DestinationConfig>,
    ) -> Self {
        let mut exporter = Self::new(config);
        for dest in destinations {
            exporter.registry.upsert(dest);
        }
        exporter
    }

    pub fn set_exit_policy(&mut self, policy: ExitPolicy) {
        self.exit_policy = policy;
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DestinationRegistry {
        &mut self.registry
    }

    pub fn stats(&self) -> ExportStats {
        self.stats
    }

    /// Create a producer queue and return its sending half.
    pub fn register_queue(&mut self) -> ExportSender {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let source = self.sources.len();
        self.sources.push(Source {
            receiver: rx,
            failed: false,
        });
        debug!(source = source, "Registered export queue");
        ExportSender::new(source, tx)
    }

    /// Run the event loop until `halt` is raised.
    ///
    /// The flag is checked on every timer tick. All connections are closed
    /// before returning.
    pub async fn run(&mut self, halt: Arc<AtomicBool>) -> ExportStats {
        let connecting = self.start_reconnects();
        info!(
            destinations = self.registry.len(),
            connecting = connecting,
            queues = self.sources.len(),
            "Exporter started"
        );

        let period = self.config.tick_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => LoopEvent::Tick,
                Some(attempt) = self.connect_rx.recv() => LoopEvent::Connected(attempt),
                event = poll_fn(|cx| poll_sources(&mut self.sources, &mut self.next_source, cx)) => event,
            };

            match event {
                LoopEvent::Tick => {
                    if halt.load(Ordering::SeqCst) {
                        info!("Exporter halting");
                        break;
                    }
                    if self.exit_policy == ExitPolicy::UntilDrained && self.drained() {
                        info!("All queues closed and backlogs drained, exporter stopping");
                        break;
                    }
                    self.start_reconnects();
                    self.registry.flush_all();
                }
                LoopEvent::Message { source, message } => self.drain_source(source, message),
                LoopEvent::Closed { source } => self.fail_source(source),
                LoopEvent::Connected(attempt) => self.connect_finished(attempt),
            }
        }

        drop(ticker);
        self.registry.close_all();
        info!(
            records_sent = self.stats.records_sent,
            records_buffered = self.stats.records_buffered,
            records_dropped = self.stats.records_dropped,
            packets_released = self.stats.packets_released,
            "Exporter stopped"
        );
        self.stats
    }

    /// Build the event loop runtime on the current thread and run to
    /// completion.
    pub fn run_blocking(mut self, halt: Arc<AtomicBool>) -> ExportResult<ExportStats> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                error!(error = %e, "Failed to create exporter event loop");
                ExportError::Runtime(e.to_string())
            })?;

        Ok(runtime.block_on(self.run(halt)))
    }

    /// Run the exporter on a dedicated thread.
    pub fn spawn(self, halt: Arc<AtomicBool>) -> ExportResult<JoinHandle<ExportResult<ExportStats>>> {
        thread::Builder::new()
            .name(EXPORTER_THREAD_NAME.to_string())
            .spawn(move || self.run_blocking(halt))
            .map_err(ExportError::from)
    }

    /// Spawn a connect task for every disconnected destination.
    fn start_reconnects(&mut self) -> usize {
        let started = self.registry.begin_reconnects();
        let count = started.len();
        for config in started {
            self.spawn_connect(config);
        }
        count
    }

    /// Open `config`'s endpoint on a separate task. The outcome comes back
    /// through the loop as [`LoopEvent::Connected`].
    fn spawn_connect(&self, config: DestinationConfig) {
        let tx = self.connect_tx.clone();
        let timeout = self.config.connect_timeout();
        tokio::spawn(async move {
            let attempt = ConnectAttempt::run(config, timeout).await;
            if tx.send(attempt).is_err() {
                debug!("Exporter stopped before connect finished");
            }
        });
    }

    fn connect_finished(&mut self, attempt: ConnectAttempt) {
        let id = attempt.config.id;
        if self.registry.complete_connect(attempt) != Some(ConnectionState::Connected) {
            return;
        }
        if let Ok(dest) = self.registry.lookup(id) {
            dest.flush_backlog();
        }
    }

    fn drain_source(&mut self, source: usize, first: ExportMessage) {
        self.dispatch(first);

        let mut handled = 1;
        while handled < self.config.max_read_batch {
            let next = match self.sources.get_mut(source) {
                Some(src) => src.receiver.try_recv(),
                None => return,
            };
            match next {
                Ok(message) => {
                    self.dispatch(message);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fail_source(source);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, message: ExportMessage) {
        match message {
            ExportMessage::Record(record) => self.export_record(&record),
            ExportMessage::PacketFin(packet) => {
                packet.release();
                self.stats.packets_released += 1;
            }
            ExportMessage::Mediator(config) => {
                let id = config.id;
                if self.registry.upsert(config) == UpsertOutcome::Unchanged {
                    return;
                }
                if let Some(config) = self.registry.begin_connect(id) {
                    self.spawn_connect(config);
                }
            }
            ExportMessage::WithdrawMediator(id) => {
                if self.registry.remove(id).is_none() {
                    debug!(dest_id = id, "Withdrawn mediator was not known");
                }
            }
        }
    }

    fn export_record(&mut self, record: &ExportRecord) {
        let dest = match self.registry.lookup(record.dest_id) {
            Ok(dest) => dest,
            Err(e) => {
                warn!(
                    dest_id = record.dest_id,
                    error = %e,
                    "Received a record for export to an unknown destination"
                );
                self.stats.records_dropped += 1;
                self.stats.unknown_destination += 1;
                return;
            }
        };

        match dest.send_or_buffer(record) {
            Delivery::Sent => self.stats.records_sent += 1,
            Delivery::Buffered => self.stats.records_buffered += 1,
            Delivery::Dropped => self.stats.records_dropped += 1,
        }
    }

    fn fail_source(&mut self, source: usize) {
        if let Some(src) = self.sources.get_mut(source) {
            if !src.failed {
                src.failed = true;
                self.stats.sources_failed += 1;
                warn!(source = source, "Export queue closed by its producer");
            }
        }
    }

    fn drained(&self) -> bool {
        self.sources.iter().all(|s| s.failed)
            && self.registry.iter().all(|d| d.backlog().is_empty())
    }
}

/// Poll queues starting at `cursor`, returning the first ready event.
fn poll_sources(
    sources: &mut [Source],
    cursor: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<LoopEvent> {
    let count = sources.len();
    for step in 0..count {
        let index = (*cursor + step) % count;
        let source = &mut sources[index];
        if source.failed {
            continue;
        }

        match source.receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                *cursor = (index + 1) % count;
                return Poll::Ready(LoopEvent::Message {
                    source: index,
                    message,
                });
            }
            Poll::Ready(None) => {
                *cursor = (index + 1) % count;
                return Poll::Ready(LoopEvent::Closed { source: index });
            }
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CapturedPacket;
    use export_buffer::{Framing, RelayHeader};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct CountedPacket {
        released: Arc<AtomicUsize>,
        halt_at: usize,
        halt: Arc<AtomicBool>,
    }

    impl CapturedPacket for CountedPacket {
        fn release(self: Box<Self>) {
            let released = self.released.fetch_add(1, Ordering::SeqCst) + 1;
            if released >= self.halt_at {
                self.halt.store(true, Ordering::SeqCst);
            }
        }
    }

    fn fast_config() -> ExporterConfig {
        ExporterConfig {
            tick_interval_ms: 20,
            connect_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_queue_indexes_sources() {
        let mut exporter = Exporter::new(fast_config());
        assert_eq!(exporter.register_queue().source(), 0);
        assert_eq!(exporter.register_queue().source(), 1);
    }

    #[tokio::test]
    async fn test_poll_sources_round_robin() {
        let mut exporter = Exporter::new(fast_config());
        let a = exporter.register_queue();
        let b = exporter.register_queue();
        for _ in 0..2 {
            a.try_send(ExportMessage::WithdrawMediator(1)).unwrap();
            b.try_send(ExportMessage::WithdrawMediator(2)).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            let polled = poll_fn(|cx| {
                Poll::Ready(poll_sources(
                    &mut exporter.sources,
                    &mut exporter.next_source,
                    cx,
                ))
            })
            .await;
            match polled {
                Poll::Ready(LoopEvent::Message { source, .. }) => order.push(source),
                _ => panic!("expected a message"),
            }
        }
        assert_eq!(order, vec![0, 1, 0, 1]);

        let idle = poll_fn(|cx| {
            Poll::Ready(poll_sources(
                &mut exporter.sources,
                &mut exporter.next_source,
                cx,
            ))
        })
        .await;
        assert!(idle.is_pending());
    }

    #[tokio::test]
    async fn test_packet_fin_releases_packets() {
        let mut exporter = Exporter::new(fast_config());
        let sender = exporter.register_queue();
        let released = Arc::new(AtomicUsize::new(0));
        let halt = Arc::new(AtomicBool::new(false));

        for _ in 0..30 {
            sender
                .try_send(ExportMessage::PacketFin(Box::new(CountedPacket {
                    released: released.clone(),
                    halt_at: 30,
                    halt: halt.clone(),
                })))
                .unwrap();
        }

        let stats = exporter.run(halt).await;
        assert_eq!(released.load(Ordering::SeqCst), 30);
        assert_eq!(stats.packets_released, 30);
    }

    #[tokio::test]
    async fn test_unknown_destination_is_dropped() {
        let mut exporter = Exporter::new(fast_config());
        let sender = exporter.register_queue();
        let released = Arc::new(AtomicUsize::new(0));
        let halt = Arc::new(AtomicBool::new(false));

        let record = ExportRecord::new(99, vec![1]).with_header(RelayHeader::new(1, 1));
        sender.try_send(ExportMessage::Record(record)).unwrap();
        sender
            .try_send(ExportMessage::PacketFin(Box::new(CountedPacket {
                released,
                halt_at: 1,
                halt: halt.clone(),
            })))
            .unwrap();

        let stats = exporter.run(halt).await;
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(stats.unknown_destination, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_is_marked_failed() {
        let mut exporter = Exporter::new(fast_config());
        drop(exporter.register_queue());
        let live = exporter.register_queue();
        let halt = Arc::new(AtomicBool::new(false));

        live.try_send(ExportMessage::PacketFin(Box::new(CountedPacket {
            released: Arc::new(AtomicUsize::new(0)),
            halt_at: 1,
            halt: halt.clone(),
        })))
        .unwrap();

        let stats = exporter.run(halt).await;
        assert_eq!(stats.sources_failed, 1);
        assert_eq!(stats.packets_released, 1);
    }

    #[tokio::test]
    async fn test_exit_when_drained() {
        let mut exporter = Exporter::new(ExporterConfig {
            framing: Framing::SelfDescribing,
            ..fast_config()
        });
        exporter.set_exit_policy(ExitPolicy::UntilDrained);
        let sender = exporter.register_queue();
        sender
            .try_send(ExportMessage::WithdrawMediator(3))
            .unwrap();
        drop(sender);

        let stats = exporter.run(Arc::new(AtomicBool::new(false))).await;
        assert_eq!(stats.sources_failed, 1);
    }

    #[test]
    fn test_run_blocking_on_plain_thread() {
        let mut exporter = Exporter::new(fast_config());
        exporter.set_exit_policy(ExitPolicy::UntilDrained);
        let halt = Arc::new(AtomicBool::new(false));

        let handle = exporter.spawn(halt).unwrap();
        assert_eq!(handle.thread().name(), Some(EXPORTER_THREAD_NAME));
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats, ExportStats::default());
    }

    #[tokio::test]
    async fn test_mediator_announcement_connects_in_background() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut exporter = Exporter::new(fast_config());
        exporter.dispatch(ExportMessage::Mediator(DestinationConfig::new(
            6,
            "127.0.0.1",
            port,
        )));
        assert_eq!(
            exporter.registry().get(6).unwrap().state(),
            ConnectionState::Connecting
        );

        // Records keep flowing into the backlog while the connect is out
        let record = ExportRecord::new(6, vec![1, 2, 3]).with_header(RelayHeader::new(1, 1));
        exporter.dispatch(ExportMessage::Record(record.clone()));
        assert_eq!(exporter.stats().records_buffered, 1);

        // Re-announcing the same endpoint does not start a second attempt
        exporter.dispatch(ExportMessage::Mediator(DestinationConfig::new(
            6,
            "127.0.0.1",
            port,
        )));

        let attempt = exporter.connect_rx.recv().await.unwrap();
        exporter.connect_finished(attempt);
        assert!(exporter.registry().get(6).unwrap().is_connected());
        assert!(exporter.registry().get(6).unwrap().backlog().is_empty());
        assert!(exporter.connect_rx.try_recv().is_err());

        let (mut peer, _) = listener.accept().await.unwrap();
        let expected = record.to_wire().unwrap();
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }
}
