use crate::coordinator::GridCoordinator;
use crate::persister::{DebouncedPersister, DEFAULT_QUIET_PERIOD};
use crate::session::{ConnectionSession, SessionConfig};
use netplot_storage::ArtifactStore;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_BASE_PORT: u16 = 9600;
pub const DEFAULT_PORT_COUNT: u16 = 100;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    pub base_port: u16,
    pub port_count: u16,
    pub output_dir: PathBuf,
    pub quiet_period: Duration,
    pub session: SessionConfig,
}

impl HubConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            base_port: DEFAULT_BASE_PORT,
            port_count: DEFAULT_PORT_COUNT,
            output_dir: output_dir.into(),
            quiet_period: DEFAULT_QUIET_PERIOD,
            session: SessionConfig::default(),
        }
    }
}

/// Opens the artifact directory, binds every cell port and serves until shutdown.
pub async fn run(config: HubConfig, shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let store = ArtifactStore::open(&config.output_dir).map_err(io::Error::other)?;
    let listener = PortListener::bind(&config.host, config.base_port, config.port_count).await?;
    let coordinator = Arc::new(GridCoordinator::new(Arc::new(store)));
    listener
        .serve(coordinator, config.quiet_period, config.session, shutdown)
        .await
}

/// One TCP listener per grid cell; the cell index is the offset from the base port.
pub struct PortListener {
    listeners: Vec<(u32, TcpListener)>,
}

impl PortListener {
    /// Binds `[base_port, base_port + port_count)` up front. Base port 0 binds one
    /// ephemeral port per cell.
    pub async fn bind(host: &str, base_port: u16, port_count: u16) -> io::Result<Self> {
        if port_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "port count must be at least 1",
            ));
        }
        if base_port != 0 && u32::from(base_port) + u32::from(port_count) > u32::from(u16::MAX) + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port range {base_port}+{port_count} exceeds 65535"),
            ));
        }

        let mut listeners = Vec::with_capacity(usize::from(port_count));
        for offset in 0..port_count {
            let port = if base_port == 0 { 0 } else { base_port + offset };
            let listener = TcpListener::bind((host, port)).await.map_err(|err| {
                io::Error::new(err.kind(), format!("bind {host}:{port}: {err}"))
            })?;
            listeners.push((u32::from(offset), listener));
        }
        Ok(Self { listeners })
    }

    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|(_, listener)| listener.local_addr())
            .collect()
    }

    pub async fn serve(
        self,
        coordinator: Arc<GridCoordinator>,
        quiet_period: Duration,
        session: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let addrs = self.local_addrs()?;
        let (persister, persister_task) =
            DebouncedPersister::spawn(coordinator.clone(), quiet_period, shutdown.clone());
        let conn_counter = Arc::new(AtomicU64::new(0));

        info!(
            event = "netplot_start",
            first = %addrs.first().map(ToString::to_string).unwrap_or_default(),
            ports = addrs.len(),
            output_dir = %coordinator.store().root().display()
        );

        let mut accept_tasks = Vec::with_capacity(self.listeners.len());
        for (plot_area, listener) in self.listeners {
            accept_tasks.push(tokio::spawn(accept_loop(
                plot_area,
                listener,
                coordinator.clone(),
                persister.clone(),
                session.clone(),
                conn_counter.clone(),
                shutdown.clone(),
            )));
        }
        for task in accept_tasks {
            let _ = task.await;
        }

        drop(persister);
        let _ = persister_task.await;
        info!(event = "netplot_stop");
        Ok(())
    }
}

async fn accept_loop(
    plot_area: u32,
    listener: TcpListener,
    coordinator: Arc<GridCoordinator>,
    persister: DebouncedPersister,
    session_config: SessionConfig,
    conn_counter: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let id = conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        let session = ConnectionSession::new(
                            format!("conn-{id}"),
                            plot_area,
                            session_config.clone(),
                            coordinator.clone(),
                            persister.clone(),
                        );
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            session.run(stream, shutdown).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "accept_error", plot_area = plot_area, error = %err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplot_core::protocol::AckMode;
    use netplot_storage::{GLOBAL_CONFIG_FILE, MANIFEST_FILE};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.expect("connect");
            let (reader, writer) = stream.into_split();
            let mut client = Self {
                reader: BufReader::new(reader),
                writer,
            };
            assert_eq!(client.read_line().await, "netplot_version=2.5\n");
            client
        }

        async fn send(&mut self, lines: &str) {
            self.writer.write_all(lines.as_bytes()).await.expect("write");
            self.writer.flush().await.expect("flush");
        }

        async fn read_line(&mut self) -> String {
            let mut line = String::new();
            let read =
                tokio::time::timeout(Duration::from_secs(3), self.reader.read_line(&mut line))
                    .await
                    .expect("read timeout")
                    .expect("read error");
            assert!(read > 0, "unexpected EOF");
            line
        }
    }

    async fn launch_hub(
        dir: &Path,
        port_count: u16,
        session: SessionConfig,
    ) -> (
        Vec<SocketAddr>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let store = ArtifactStore::open(dir).expect("open store");
        let coordinator = Arc::new(GridCoordinator::new(Arc::new(store)));
        let listener = PortListener::bind("127.0.0.1", 0, port_count)
            .await
            .expect("bind");
        let addrs = listener.local_addrs().expect("addrs");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.serve(
            coordinator,
            Duration::from_millis(50),
            session,
            rx,
        ));
        (addrs, tx, handle)
    }

    async fn wait_for_manifest(dir: &Path, expected: &[&str]) -> Vec<String> {
        let path = dir.join(MANIFEST_FILE);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(names) = serde_json::from_str::<Vec<String>>(&raw) {
                    if expected.iter().all(|name| names.iter().any(|seen| seen == name)) {
                        return names;
                    }
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "manifest never listed {expected:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn read_json(dir: &Path, name: &str) -> serde_json::Value {
        let raw = std::fs::read_to_string(dir.join(name)).expect("read artifact");
        serde_json::from_str(&raw).expect("parse artifact")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn round_trip_writes_global_plot_and_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let (addrs, shutdown_tx, handle) =
            launch_hub(dir.path(), 2, SessionConfig::default()).await;

        let mut client = Client::connect(addrs[0]).await;
        client
            .send("set grid=2,2\nset frame_title=T\nset plot_title=P0\nset plot_name=0 Foo\n0:1.0:2.0\n0:3.0:4.0\n\n")
            .await;
        assert_eq!(client.read_line().await, "OK\n");

        let names = wait_for_manifest(dir.path(), &["0_000.json", GLOBAL_CONFIG_FILE]).await;
        assert_eq!(names, vec!["0_000.json", GLOBAL_CONFIG_FILE]);

        let global = read_json(dir.path(), GLOBAL_CONFIG_FILE);
        assert_eq!(global["grid"], serde_json::json!([2, 2]));
        assert_eq!(global["frame_title"], "T");

        let plot = read_json(dir.path(), "0_000.json");
        assert_eq!(plot["plot_title"], "P0");
        assert_eq!(plot["plot_name"], "0 Foo");
        assert_eq!(
            plot["plot_values"],
            serde_json::json!([[0, 1.0, 2.0], [0, 3.0, 4.0]])
        );

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_cells_write_distinct_files_and_one_global() {
        let dir = TempDir::new().expect("tempdir");
        let (addrs, shutdown_tx, handle) =
            launch_hub(dir.path(), 2, SessionConfig::default()).await;

        let mut first = Client::connect(addrs[0]).await;
        first.send("set grid=1,2\nset plot_title=A\n").await;
        assert_eq!(first.read_line().await, "OK\n");
        wait_for_manifest(dir.path(), &[GLOBAL_CONFIG_FILE]).await;

        let mut second = Client::connect(addrs[1]).await;
        second
            .send("set grid=1,2\nset plot_title=B\nset plot_name=0 b\n0:1:1\n\n")
            .await;
        assert_eq!(second.read_line().await, "OK\n");
        first.send("set plot_name=0 a\n0:2:2\n\n").await;
        assert_eq!(first.read_line().await, "OK\n");

        let names = wait_for_manifest(dir.path(), &["0_000.json", "1_000.json"]).await;
        assert_eq!(names, vec!["0_000.json", "1_000.json", GLOBAL_CONFIG_FILE]);
        assert_eq!(read_json(dir.path(), "0_000.json")["plot_title"], "A");
        assert_eq!(read_json(dir.path(), "1_000.json")["plot_area"], 1);
        assert_eq!(read_json(dir.path(), "1_000.json")["plot_title"], "B");
        assert_eq!(
            read_json(dir.path(), GLOBAL_CONFIG_FILE)["grid"],
            serde_json::json!([1, 2])
        );

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_grid_line_keeps_finished_plots() {
        let dir = TempDir::new().expect("tempdir");
        let (addrs, shutdown_tx, handle) =
            launch_hub(dir.path(), 2, SessionConfig::default()).await;

        let mut first = Client::connect(addrs[0]).await;
        first
            .send("set grid=1,2\nset plot_title=A\nset plot_name=0 a\n0:1:1\n\n")
            .await;
        assert_eq!(first.read_line().await, "OK\n");
        wait_for_manifest(dir.path(), &[GLOBAL_CONFIG_FILE, "0_000.json"]).await;

        let mut second = Client::connect(addrs[1]).await;
        second
            .send("set grid=1,2\nset plot_title=B\nset plot_name=0 b\n0:1:1\n\n")
            .await;
        assert_eq!(second.read_line().await, "OK\n");
        wait_for_manifest(dir.path(), &["1_000.json"]).await;

        first.send("set grid=1,2\n").await;
        assert_eq!(first.read_line().await, "OK\n");
        first.send("set plot_name=1 c\n0:3:3\n\n").await;
        assert_eq!(first.read_line().await, "OK\n");

        let names = wait_for_manifest(dir.path(), &["0_001.json"]).await;
        assert_eq!(
            names,
            vec!["0_000.json", "0_001.json", "1_000.json", GLOBAL_CONFIG_FILE]
        );
        assert_eq!(read_json(dir.path(), "0_001.json")["plot_title"], "A");

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnecting_first_cell_starts_a_new_grid() {
        let dir = TempDir::new().expect("tempdir");
        let (addrs, shutdown_tx, handle) =
            launch_hub(dir.path(), 1, SessionConfig::default()).await;

        let mut first = Client::connect(addrs[0]).await;
        first
            .send("set grid=1,1\nset plot_title=A\nset plot_name=0 a\n0:1:1\n\n")
            .await;
        assert_eq!(first.read_line().await, "OK\n");
        wait_for_manifest(dir.path(), &["0_000.json"]).await;
        drop(first);

        let mut again = Client::connect(addrs[0]).await;
        again.send("set grid=2,1\n").await;
        assert_eq!(again.read_line().await, "OK\n");
        assert!(!dir.path().join("0_000.json").exists());
        assert!(!dir.path().join(GLOBAL_CONFIG_FILE).exists());

        again
            .send("set plot_title=B\nset plot_name=0 b\n0:2:2\n\n")
            .await;
        assert_eq!(again.read_line().await, "OK\n");
        wait_for_manifest(dir.path(), &["0_000.json", GLOBAL_CONFIG_FILE]).await;
        assert_eq!(read_json(dir.path(), "0_000.json")["plot_title"], "B");
        assert_eq!(
            read_json(dir.path(), GLOBAL_CONFIG_FILE)["grid"],
            serde_json::json!([2, 1])
        );

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn per_line_mode_acknowledges_every_line() {
        let dir = TempDir::new().expect("tempdir");
        let session = SessionConfig {
            ack_mode: AckMode::PerLine,
            ..SessionConfig::default()
        };
        let (addrs, shutdown_tx, handle) = launch_hub(dir.path(), 1, session).await;

        let mut client = Client::connect(addrs[0]).await;
        client.send("# comment\nset frame_title=x\ninit\n").await;
        for _ in 0..3 {
            assert_eq!(client.read_line().await, "OK\n");
        }

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_sessions_are_closed() {
        let dir = TempDir::new().expect("tempdir");
        let session = SessionConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..SessionConfig::default()
        };
        let (addrs, shutdown_tx, handle) = launch_hub(dir.path(), 1, session).await;

        let mut client = Client::connect(addrs[0]).await;
        let mut rest = String::new();
        let read = tokio::time::timeout(Duration::from_secs(3), client.reader.read_line(&mut rest))
            .await
            .expect("session never closed")
            .expect("read error");
        assert_eq!(read, 0);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_every_accept_loop() {
        let dir = TempDir::new().expect("tempdir");
        let (_addrs, shutdown_tx, handle) =
            launch_hub(dir.path(), 3, SessionConfig::default()).await;

        let _ = shutdown_tx.send(true);
        let result = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("serve did not stop")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_fails_on_taken_port_and_bad_range() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = taken.local_addr().expect("addr").port();

        let err = PortListener::bind("127.0.0.1", port, 1)
            .await
            .err()
            .expect("taken port must fail");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let err = PortListener::bind("127.0.0.1", 65500, 100)
            .await
            .err()
            .expect("range must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = PortListener::bind("127.0.0.1", 9600, 0)
            .await
            .err()
            .expect("empty range must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
