//! Wires the resolver, supervisor, publisher and HTTP server together and runs
//! the single coordinator loop that owns them.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{error, info, warn};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::constants::generate_session_id;
use crate::hub::BroadcastHub;
use crate::metadata::{ArtworkTable, Enricher, ResolvedMetadata};
use crate::publisher::{load_snapshot, push_to_mount, AdminTarget, MetadataPublisher};
use crate::resolver::ProgramResolver;
use crate::schedule::{BreakPatterns, ResolvedSchedule, WeeklySchedule};
use crate::server::{self, AppState};
use crate::supervisor::{PipelineEvent, PipelineHealth, Supervisor};
use crate::transcoder::{CommandTranscoder, Transcoder};

/// Schedule from the configured file, or an empty one if it cannot be read
pub fn load_schedule(config: &RelayConfig) -> ResolvedSchedule {
    match WeeklySchedule::load(&config.schedule_file) {
        Ok(schedule) => schedule.resolve(),
        Err(e) => {
            warn!("{}; every slot falls back to the default program", e);
            ResolvedSchedule::default()
        }
    }
}

pub fn build_resolver(config: &RelayConfig) -> ProgramResolver {
    let breaks = BreakPatterns::from(config.commercial_breaks.clone());
    ProgramResolver::new(
        load_schedule(config),
        breaks,
        config.station_clock(),
        config.station.fallback_title.clone(),
    )
}

pub fn build_enricher(config: &RelayConfig) -> Enricher {
    let artwork = match &config.artwork_file {
        Some(path) => ArtworkTable::load_or_empty(path),
        None => ArtworkTable::new(),
    };
    Enricher::new(config.station.clone(), artwork)
}

/// Admin push target with its password resolved
pub fn build_admin_target(config: &RelayConfig) -> Result<Option<AdminTarget>, String> {
    let Some(admin) = &config.admin else {
        return Ok(None);
    };
    let credentials = if admin.password.is_none() {
        crate::credentials::load_credentials()
            .map_err(|e| format!("Failed to load credentials: {}", e))?
    } else {
        None
    };
    let password = admin.resolve_password(&credentials)?;
    Ok(Some(AdminTarget::from_config(admin, password)))
}

/// Owns every piece of mutable relay state; driven by [`Coordinator::run`]
pub struct Coordinator {
    resolver: ProgramResolver,
    enricher: Enricher,
    supervisor: Supervisor,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    publisher: MetadataPublisher,
    metadata_tx: watch::Sender<ResolvedMetadata>,
    health_tx: watch::Sender<PipelineHealth>,
    tick_interval: Duration,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: ProgramResolver,
        enricher: Enricher,
        supervisor: Supervisor,
        events: mpsc::UnboundedReceiver<PipelineEvent>,
        publisher: MetadataPublisher,
        initial: ResolvedMetadata,
        tick_interval: Duration,
    ) -> Self {
        let (metadata_tx, _) = watch::channel(initial);
        let (health_tx, _) = watch::channel(PipelineHealth::default());
        Self {
            resolver,
            enricher,
            supervisor,
            events,
            publisher,
            metadata_tx,
            health_tx,
            tick_interval,
        }
    }

    pub fn metadata(&self) -> watch::Receiver<ResolvedMetadata> {
        self.metadata_tx.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<PipelineHealth> {
        self.health_tx.subscribe()
    }

    /// Metadata for an instant
    pub fn compute(&self, at: DateTime<Utc>) -> ResolvedMetadata {
        self.enricher.enrich(&self.resolver.resolve(at), at)
    }

    /// Recompute, publish, and let the supervisor react
    pub async fn tick(&mut self, at: DateTime<Utc>, now: Instant) {
        let metadata = self.compute(at);
        self.publisher.publish(&metadata);
        self.metadata_tx.send_replace(metadata.clone());
        self.supervisor.on_tick(&metadata, now).await;
        self.refresh_health(now);
    }

    /// Feed a watcher event to the supervisor
    pub fn handle_event(&mut self, event: PipelineEvent, now: Instant) {
        self.supervisor.handle_event(event, now);
        self.refresh_health(now);
    }

    fn refresh_health(&self, now: Instant) {
        self.health_tx.send_replace(self.supervisor.health(now));
    }

    /// Run until `shutdown` is cancelled, then stop the pipeline
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let restart_at = self.supervisor.next_restart_at();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now(), Instant::now()).await;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event, Instant::now());
                }
                _ = sleep_until_restart(restart_at), if restart_at.is_some() => {
                    let metadata = self.metadata_tx.borrow().clone();
                    let now = Instant::now();
                    self.supervisor.poll_restart(&metadata, now).await;
                    self.refresh_health(now);
                }
            }
        }

        self.supervisor.shutdown().await;
        self.refresh_health(Instant::now());
        info!("Coordinator stopped");
    }
}

async fn sleep_until_restart(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run the relay service until SIGINT or SIGTERM
pub fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Acquire exclusive lock to prevent two relays writing the same state
    let lock_path = config.lock_path();
    let _lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
    _lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "Another relay is already running. Lock file: {}",
            lock_path.display()
        )
    })?;
    // Lock will be held until _lock_file is dropped (end of function)

    let resolver = build_resolver(&config);
    let enricher = build_enricher(&config);
    let admin = build_admin_target(&config)?;

    println!("Starting station relay");
    println!("Station: {} ({})", config.station.artist, config.station.comment);
    println!("Clock: {}", resolver.clock().describe());
    println!("Transcoder input: {}", config.transcoder.input_url);
    match &admin {
        Some(target) => println!(
            "Metadata push: ENABLED ({} -> {})",
            target.base_url,
            target.mounts.join(", ")
        ),
        None => println!("Metadata push: DISABLED"),
    }
    println!("State file: {}", config.state_file.display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let mut publisher = MetadataPublisher::new(config.state_file.clone(), admin)?;
        let initial = match load_snapshot(&config.state_file) {
            Some(snapshot) => {
                info!("Resuming from snapshot: {}", snapshot.title);
                publisher.seed(snapshot.clone());
                snapshot
            }
            None => enricher.enrich(&resolver.resolve(Utc::now()), Utc::now()),
        };

        let hub = BroadcastHub::new(config.server.buffer_chunks);
        let transcoder: Box<dyn Transcoder> = Box::new(CommandTranscoder::new(&config.transcoder));
        let (supervisor, events) = Supervisor::new(
            transcoder,
            hub.clone(),
            config.restart_policy(),
            config.kill_timeout(),
        );
        let push_status = publisher.push_status();
        let coordinator = Coordinator::new(
            resolver,
            enricher,
            supervisor,
            events,
            publisher,
            initial,
            config.tick_interval(),
        );

        let state = Arc::new(AppState {
            hub,
            metadata: coordinator.metadata(),
            health: coordinator.health(),
            push_status,
            session_id: generate_session_id(),
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_signal(shutdown.clone()));

        let coordinator_task = tokio::spawn(coordinator.run(shutdown.clone()));

        let server_result = server::serve(
            state,
            &config.server.bind,
            config.server.port,
            &config.server.stream_path,
            shutdown.clone(),
        )
        .await;
        if let Err(e) = &server_result {
            error!("HTTP server stopped: {}", e);
        }

        // server errors also stop the pipeline
        shutdown.cancel();
        if let Err(e) = coordinator_task.await {
            error!("Coordinator task failed: {}", e);
        }

        server_result.map_err(|e| e.to_string())?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

/// Resolve the metadata for one instant, print it, and optionally push it
pub fn now(
    config: RelayConfig,
    at: Option<DateTime<Utc>>,
    push: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let at = at.unwrap_or_else(Utc::now);
    let resolver = build_resolver(&config);
    let enricher = build_enricher(&config);
    let program = resolver.resolve(at);
    let metadata = enricher.enrich(&program, at);

    info!(
        "{} local, kind {:?}",
        resolver.clock().local_time(at),
        program.kind
    );
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    if !push {
        return Ok(());
    }
    let Some(admin) = build_admin_target(&config)? else {
        return Err("--push requires an [admin] section in the config".into());
    };

    let rt = tokio::runtime::Runtime::new()?;
    let failures = rt.block_on(async {
        let client = reqwest::Client::builder().timeout(admin.timeout).build()?;
        let mut failures = 0;
        for mount in &admin.mounts {
            match push_to_mount(&client, &admin, mount, &metadata.title).await {
                Ok(()) => println!("{}: updated", mount),
                Err(e) => {
                    println!("{}: FAILED ({})", mount, e);
                    failures += 1;
                }
            }
        }
        Ok::<usize, reqwest::Error>(failures)
    })?;

    if failures > 0 {
        return Err(format!("{} of {} mounts failed", failures, admin.mounts.len()).into());
    }
    Ok(())
}
