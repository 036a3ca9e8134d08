use crate::coordinator::{GridCoordinator, LifecycleGuard};
use crate::persister::DebouncedPersister;
use netplot_core::aggregator::{Action, PlotAggregator};
use netplot_core::command::{parse, Command};
use netplot_core::protocol::{greeting, AckMode, LineDecoder, ACK, DEFAULT_MAX_LINE_BYTES};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ack_mode: AckMode,
    pub idle_timeout: Option<Duration>,
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::PerChunk,
            idle_timeout: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// One accepted connection bound to one grid cell.
pub struct ConnectionSession {
    conn_id: String,
    plot_area: u32,
    config: SessionConfig,
    coordinator: Arc<GridCoordinator>,
    persister: DebouncedPersister,
    aggregator: PlotAggregator,
    /// Held by the cell 0 session between its sweep and its global save.
    sweep_guard: Option<LifecycleGuard>,
    /// Lifecycle joined at this connection's global boundary.
    generation: Option<u64>,
}

impl ConnectionSession {
    pub fn new(
        conn_id: String,
        plot_area: u32,
        config: SessionConfig,
        coordinator: Arc<GridCoordinator>,
        persister: DebouncedPersister,
    ) -> Self {
        Self {
            conn_id,
            plot_area,
            config,
            coordinator,
            persister,
            aggregator: PlotAggregator::new(plot_area),
            sweep_guard: None,
            generation: None,
        }
    }

    pub async fn run(mut self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (mut reader, mut writer) = stream.into_split();
        info!(
            event = "session_open",
            conn_id = %self.conn_id,
            plot_area = self.plot_area,
            peer = %peer
        );

        if let Err(err) = writer.write_all(greeting().as_bytes()).await {
            warn!(event = "session_write_error", conn_id = %self.conn_id, error = %err);
            return;
        }

        let mut decoder = LineDecoder::new(self.config.max_line_bytes);
        let mut buf = vec![0u8; self.config.max_line_bytes.max(1)];
        let reason = loop {
            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break "shutdown";
                    }
                    continue;
                }
                read = read_chunk(&mut reader, &mut buf, self.config.idle_timeout) => read,
            };

            let size = match read {
                Ok(0) => break "eof",
                Ok(size) => size,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break "idle_timeout",
                Err(err) => {
                    warn!(event = "session_read_error", conn_id = %self.conn_id, error = %err);
                    break "read_error";
                }
            };

            let lines = decoder.push_chunk(&buf[..size]);
            let line_count = lines.len();
            for line in lines {
                self.process_line(&line).await;
            }
            self.persister.notify_activity();

            let acks = match self.config.ack_mode {
                AckMode::PerChunk => 1,
                AckMode::PerLine => line_count,
            };
            if acks == 0 {
                continue;
            }
            if let Err(err) = writer.write_all(&ACK.repeat(acks)).await {
                warn!(event = "session_write_error", conn_id = %self.conn_id, error = %err);
                break "write_error";
            }
        };

        if let Some(line) = decoder.finish() {
            self.process_line(&line).await;
            self.persister.notify_activity();
        }
        if self.aggregator.pending_values() > 0 {
            debug!(
                event = "unflushed_plot_dropped",
                conn_id = %self.conn_id,
                plot_area = self.plot_area,
                values = self.aggregator.pending_values()
            );
        }
        info!(
            event = "session_close",
            conn_id = %self.conn_id,
            plot_area = self.plot_area,
            reason = reason
        );
    }

    async fn process_line(&mut self, line: &str) {
        let command = parse(line);
        match &command {
            Command::Malformed(raw) => {
                debug!(event = "malformed_line", conn_id = %self.conn_id, line = %raw);
            }
            Command::EnableStatus(enabled) => {
                debug!(event = "status_toggled", conn_id = %self.conn_id, enabled = *enabled);
            }
            Command::SetGrid { rows, columns } if self.aggregator.grid_declared() => {
                debug!(
                    event = "grid_redeclared",
                    conn_id = %self.conn_id,
                    rows = *rows,
                    columns = *columns
                );
            }
            _ => {}
        }
        for action in self.aggregator.feed(command) {
            self.apply(action).await;
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::BeginGrid { rows, columns } => {
                match self.coordinator.begin_grid_if_needed(self.plot_area).await {
                    Ok(Some(guard)) => {
                        info!(
                            event = "grid_declared",
                            conn_id = %self.conn_id,
                            generation = guard.generation(),
                            rows = rows,
                            columns = columns
                        );
                        self.sweep_guard = Some(guard);
                    }
                    Ok(None) => debug!(
                        event = "grid_declared_by_cell",
                        conn_id = %self.conn_id,
                        plot_area = self.plot_area
                    ),
                    Err(err) => error!(event = "sweep_error", conn_id = %self.conn_id, error = %err),
                }
            }
            Action::SaveGlobal(config) => {
                let saved = match self.sweep_guard.take() {
                    Some(guard) => self.coordinator.save_global_held(guard, &config),
                    None => self.coordinator.save_global(&config).await,
                };
                match saved {
                    Ok(save) => {
                        self.generation = Some(save.generation);
                        if save.written {
                            info!(
                                event = "global_saved",
                                conn_id = %self.conn_id,
                                plot_area = self.plot_area,
                                generation = save.generation
                            );
                        } else {
                            debug!(event = "global_already_saved", conn_id = %self.conn_id);
                        }
                    }
                    Err(err) => {
                        error!(event = "global_save_error", conn_id = %self.conn_id, error = %err)
                    }
                }
            }
            Action::FlushPlot { record, duplicate } => {
                if duplicate {
                    warn!(
                        event = "duplicate_plot",
                        conn_id = %self.conn_id,
                        plot_area = record.plot_area,
                        plot_number = record.plot_number
                    );
                }
                let generation = match self.generation {
                    Some(generation) => generation,
                    None => {
                        let generation = self.coordinator.generation().await;
                        self.generation = Some(generation);
                        generation
                    }
                };
                match self.coordinator.save_plot(&record, generation).await {
                    Ok(true) => info!(
                        event = "plot_saved",
                        conn_id = %self.conn_id,
                        plot_area = record.plot_area,
                        plot_number = record.plot_number,
                        values = record.plot_values.len()
                    ),
                    Ok(false) => debug!(
                        event = "plot_not_written",
                        conn_id = %self.conn_id,
                        plot_area = record.plot_area,
                        plot_number = record.plot_number
                    ),
                    Err(err) => {
                        error!(event = "plot_save_error", conn_id = %self.conn_id, error = %err)
                    }
                }
            }
        }
    }
}

async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize> {
    let Some(limit) = idle_timeout else {
        return reader.read(buf).await;
    };
    match tokio::time::timeout(limit, reader.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle read timeout")),
    }
}
