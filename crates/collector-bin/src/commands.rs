//! `run`, `probe` and `replay` implementations.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use collector_config_and_utils::Config;
use collector_export::{
    DestinationId, DestinationRegistry, ExitPolicy, ExportMessage, ExportRecord, ExportStats,
    Exporter, Framing,
};
use export_buffer::ber_pdu_length;
use tracing::{info, warn};

/// Run the exporter until halted.
pub fn run(config: &Config, halt: Arc<AtomicBool>) -> anyhow::Result<ExportStats> {
    let exporter =
        Exporter::with_destinations(config.export.clone(), config.destinations.iter().cloned());
    let handle = exporter.spawn(halt)?;
    join_exporter(handle)
}

/// Try every configured destination once.
///
/// Returns `(reachable, total)`.
pub fn probe(config: &Config) -> anyhow::Result<(usize, usize)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create probe runtime")?;

    let mut registry =
        DestinationRegistry::new(config.export.framing, config.export.buffer.clone());
    for dest in &config.destinations {
        registry.upsert(dest.clone());
    }

    let timeout = config.export.connect_timeout();
    let reachable = runtime.block_on(registry.connect_all(timeout));
    for dest in registry.iter() {
        info!(
            dest_id = dest.id(),
            endpoint = %dest.config().endpoint(),
            connected = dest.is_connected(),
            "Probed mediator"
        );
    }
    registry.close_all();

    Ok((reachable, registry.len()))
}

/// Export every BER record in `file` to destination `dest_id`, stopping
/// once the backlog has drained or on halt.
pub fn replay(
    config: &Config,
    dest_id: DestinationId,
    file: &Path,
    halt: Arc<AtomicBool>,
) -> anyhow::Result<ExportStats> {
    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let records = split_ber_records(&data)?;
    info!(
        file = %file.display(),
        records = records.len(),
        dest_id = dest_id,
        "Replaying captured records"
    );

    let mut export = config.export.clone();
    export.framing = Framing::SelfDescribing;
    let mut exporter = Exporter::with_destinations(export, config.destinations.iter().cloned());
    if exporter.registry().get(dest_id).is_none() {
        bail!("destination {} is not configured", dest_id);
    }
    exporter.set_exit_policy(ExitPolicy::UntilDrained);

    let sender = exporter.register_queue();
    let handle = exporter.spawn(halt.clone())?;

    for body in records {
        if halt.load(Ordering::SeqCst) {
            warn!("Replay interrupted before all records were queued");
            break;
        }
        let record = ExportRecord::new(dest_id, body.to_vec());
        if let Err(e) = sender.blocking_send(ExportMessage::Record(record)) {
            warn!(error = %e, "Exporter stopped accepting records");
            break;
        }
    }
    drop(sender);

    join_exporter(handle)
}

fn join_exporter(
    handle: std::thread::JoinHandle<collector_export::ExportResult<ExportStats>>,
) -> anyhow::Result<ExportStats> {
    let stats = handle
        .join()
        .map_err(|_| anyhow!("exporter thread panicked"))??;
    Ok(stats)
}

/// Split a concatenation of BER-encoded PDUs into individual records.
pub fn split_ber_records(data: &[u8]) -> anyhow::Result<Vec<&[u8]>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let len = ber_pdu_length(rest)
            .with_context(|| format!("bad record at byte {}", offset))?;
        if len > rest.len() {
            bail!(
                "record at byte {} claims {} bytes but only {} remain",
                offset,
                len,
                rest.len()
            );
        }
        records.push(&rest[..len]);
        offset += len;
    }
    Ok(records)
}
