//! [`LocalizerNode`] – owns the localizer's execution contexts.
//!
//! | Context | Runs on | Work |
//! |---|---|---|
//! | scan worker | dedicated `scan-worker` thread | [`Localizer::process`] / [`Localizer::set_initial_pose`], strictly in arrival order |
//! | map path | blocking pool, one task per map | [`MapLoader::load`] |
//! | diagnostics | async task | [`DiagnosticsReporter::run`] |
//!
//! Scans and pose resets share one bounded queue, so a pose reset always
//! applies to the scans submitted after it.  When the queue is full,
//! [`LocalizerNode::submit_scan`] waits.
//!
//! [`LocalizerNode::shutdown`] closes the queue (queued scans are still
//! processed), stops the diagnostics task, and joins both.

use std::sync::Arc;
use std::thread;

use scanloc_localizer::{
    DiagnosticsReporter, HealthBoard, HealthReader, Localizer, MapLoader, MapStore, RegistrationEngine,
};
use scanloc_middleware::EventBus;
use scanloc_perception::{FrameResolver, Preprocessor};
use scanloc_types::{HealthSnapshot, LocError, PointCloud, PoseStamped, ScanFrame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;

/// Work item for the scan worker.
#[derive(Debug, Clone)]
pub enum LocalizerInput {
    Scan(ScanFrame),
    InitialPose(PoseStamped),
}

/// Running localizer.  Must be created inside a Tokio runtime.
pub struct LocalizerNode<E: RegistrationEngine> {
    inputs: Option<mpsc::Sender<LocalizerInput>>,
    loader: Arc<MapLoader<E>>,
    preprocessor: Arc<Preprocessor>,
    health: HealthBoard,
    bus: EventBus,
    shutdown: watch::Sender<bool>,
    worker: Option<thread::JoinHandle<()>>,
    diagnostics: Option<JoinHandle<()>>,
}

impl<E: RegistrationEngine> LocalizerNode<E> {
    /// Wire the components from `config` and start the scan worker and the
    /// diagnostics task.
    ///
    /// Fails only when the OS refuses to start the worker thread.
    pub fn spawn(config: &Config, engine: Arc<E>, frames: FrameResolver) -> Result<Self, LocError> {
        let bus = EventBus::new(config.bus_capacity.max(1));
        let health = HealthBoard::new();
        let store = Arc::new(MapStore::new());

        let loader = Arc::new(MapLoader::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            config.registration,
            health.clone(),
        ));
        let mut localizer = Localizer::new(
            config.localizer.clone(),
            engine,
            store,
            frames,
            bus.clone(),
            health.clone(),
        );

        let (inputs, mut queue) = mpsc::channel(config.scan_queue_depth.max(1));
        let worker = thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || {
                while let Some(input) = queue.blocking_recv() {
                    match input {
                        LocalizerInput::Scan(scan) => {
                            localizer.process(&scan);
                        }
                        LocalizerInput::InitialPose(pose) => localizer.set_initial_pose(&pose),
                    }
                }
                info!("scan worker stopped");
            })
            .map_err(|e| LocError::Task(format!("scan worker: {e}")))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reporter = DiagnosticsReporter::new(
            config.diagnostics.clone(),
            health.subscribe(),
            bus.clone(),
            config.localizer.degraded_rejection_threshold,
        );
        let diagnostics = tokio::spawn(reporter.run(shutdown_rx));

        info!(
            map_frame = %config.localizer.map_frame,
            body_frame = %config.localizer.body_frame,
            scan_queue_depth = config.scan_queue_depth,
            "localizer node started"
        );

        Ok(Self {
            inputs: Some(inputs),
            loader,
            preprocessor: Arc::new(Preprocessor::new(config.preprocess)),
            health,
            bus,
            shutdown,
            worker: Some(worker),
            diagnostics: Some(diagnostics),
        })
    }

    /// Queue an already-downsampled scan.
    pub async fn submit_scan(&self, scan: ScanFrame) -> Result<(), LocError> {
        self.send(LocalizerInput::Scan(scan)).await
    }

    /// Downsample `raw` and queue the result.
    pub async fn submit_raw_scan(&self, raw: &ScanFrame) -> Result<(), LocError> {
        let filtered = self.preprocessor.downsample(raw);
        debug!(seq = raw.seq, raw = raw.cloud.len(), filtered = filtered.cloud.len(), "scan downsampled");
        self.submit_scan(filtered).await
    }

    /// Queue an operator pose reset; it applies to every scan submitted
    /// after it.
    pub async fn set_initial_pose(&self, pose: PoseStamped) -> Result<(), LocError> {
        self.send(LocalizerInput::InitialPose(pose)).await
    }

    /// Build a target from `map` on the blocking pool and swap it in.
    ///
    /// Returns the new map generation.
    pub async fn load_map(&self, map: PointCloud) -> Result<u64, LocError> {
        let loader = Arc::clone(&self.loader);
        tokio::task::spawn_blocking(move || loader.load(&map))
            .await
            .map_err(|e| LocError::Task(format!("map loader: {e}")))?
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn health_reader(&self) -> HealthReader {
        self.health.subscribe()
    }

    /// Bus every output is published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Drain the scan queue, stop diagnostics and wait for both.
    pub async fn shutdown(mut self) -> Result<(), LocError> {
        self.inputs.take();
        self.shutdown.send_replace(true);

        if let Some(worker) = self.worker.take() {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| LocError::Task(format!("scan worker join: {e}")))?
                .map_err(|_| LocError::Task("scan worker panicked".to_string()))?;
        }
        if let Some(diagnostics) = self.diagnostics.take() {
            diagnostics
                .await
                .map_err(|e| LocError::Task(format!("diagnostics: {e}")))?;
        }
        info!("localizer node stopped");
        Ok(())
    }

    async fn send(&self, input: LocalizerInput) -> Result<(), LocError> {
        let Some(inputs) = self.inputs.as_ref() else {
            return Err(LocError::InputClosed);
        };
        inputs.send(input).await.map_err(|_| LocError::InputClosed)
    }
}

impl<E: RegistrationEngine> Drop for LocalizerNode<E> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nalgebra::Point3;
    use scanloc_localizer::{RegistrationError, RegistrationParams, RegistrationResult, RegistrationTarget};
    use scanloc_middleware::Topic;
    use scanloc_perception::TfEngine;
    use scanloc_types::{DiagnosticLevel, EventPayload, LocalizerState, Transform};
    use std::error::Error;
    use std::sync::Mutex;
    use std::time::Duration;

    // ── Fake engine: accepts every guess as-is ──────────────────────────

    struct EchoTarget {
        params: RegistrationParams,
    }

    impl RegistrationTarget for EchoTarget {
        fn params(&self) -> &RegistrationParams {
            &self.params
        }
    }

    #[derive(Default)]
    struct EchoEngine {
        source_sizes: Mutex<Vec<usize>>,
        threads: Mutex<Vec<Option<String>>>,
    }

    impl RegistrationEngine for EchoEngine {
        type Target = EchoTarget;

        fn build_target(&self, map: &PointCloud, params: &RegistrationParams) -> Result<EchoTarget, RegistrationError> {
            if map.iter().any(|p| !p.x.is_finite()) {
                return Err(RegistrationError::Build("non-finite map point".into()));
            }
            Ok(EchoTarget { params: *params })
        }

        fn align(
            &self,
            source: &PointCloud,
            initial_guess: &Transform,
            _target: &EchoTarget,
        ) -> Result<RegistrationResult, RegistrationError> {
            self.source_sizes.lock().expect("sizes").push(source.len());
            self.threads
                .lock()
                .expect("threads")
                .push(std::thread::current().name().map(str::to_string));
            Ok(RegistrationResult {
                pose: *initial_guess,
                fit_score: 5.0,
                iterations: 3,
            })
        }
    }

    fn spawn(config: &Config) -> (LocalizerNode<EchoEngine>, Arc<EchoEngine>) {
        let engine = Arc::new(EchoEngine::default());
        let node = LocalizerNode::spawn(config, Arc::clone(&engine), FrameResolver::new(Arc::new(TfEngine::new())))
            .expect("node spawn");
        (node, engine)
    }

    fn map() -> PointCloud {
        (0..20).map(|i| Point3::new(i as f32, -1.0, 0.0)).collect()
    }

    fn scan(seq: u64, points: Vec<Point3<f32>>) -> ScanFrame {
        ScanFrame::new(seq, Utc::now(), "base_link", PointCloud::from_points(points))
    }

    async fn wait_for<F>(reader: &mut HealthReader, pred: F) -> Result<HealthSnapshot, Box<dyn Error>>
    where
        F: Fn(&HealthSnapshot) -> bool,
    {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = reader.snapshot();
                if pred(&snapshot) || !reader.changed().await {
                    return snapshot;
                }
            }
        })
        .await?;
        Ok(waited)
    }

    #[tokio::test]
    async fn pose_published_after_map_and_initial_pose() -> Result<(), Box<dyn Error>> {
        let (node, _) = spawn(&Config::default());
        let mut poses = node.bus().subscribe_to(Topic::Pose);

        assert_eq!(node.load_map(map()).await?, 1);
        assert_eq!(node.health().state, LocalizerState::Initializing);

        node.set_initial_pose(PoseStamped {
            stamp: Utc::now(),
            frame_id: "map".into(),
            pose: Transform::translation(5.0, 0.0, 0.0),
        })
        .await?;
        node.submit_scan(scan(1, vec![Point3::new(1.0, 0.0, 0.0)])).await?;

        let event = tokio::time::timeout(Duration::from_secs(2), poses.recv()).await??;
        match event.payload {
            EventPayload::Pose(msg) => assert!((msg.pose.translation.vector.x - 5.0).abs() < 1e-5),
            other => panic!("unexpected payload {other:?}"),
        }
        let snap = node.health();
        assert_eq!(snap.state, LocalizerState::Tracking);
        assert_eq!(snap.accepted_poses, 1);

        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn scans_run_on_the_named_worker_thread() -> Result<(), Box<dyn Error>> {
        let (node, engine) = spawn(&Config::default());
        let mut reader = node.health_reader();
        node.load_map(map()).await?;

        node.submit_scan(scan(1, vec![Point3::new(1.0, 0.0, 0.0)])).await?;
        node.submit_scan(scan(2, vec![Point3::new(1.0, 0.0, 0.0)])).await?;
        wait_for(&mut reader, |s| s.seq == 2).await?;
        node.shutdown().await?;

        let threads = engine.threads.lock().expect("threads");
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|name| name.as_deref() == Some("scan-worker")));
        Ok(())
    }

    #[tokio::test]
    async fn scan_without_map_is_skipped() -> Result<(), Box<dyn Error>> {
        let (node, engine) = spawn(&Config::default());
        let mut reader = node.health_reader();

        node.submit_scan(scan(1, vec![Point3::new(1.0, 0.0, 0.0)])).await?;
        let snap = wait_for(&mut reader, |s| s.skipped_scans == 1).await?;

        assert_eq!(snap.skipped_scans, 1);
        assert_eq!(snap.state, LocalizerState::Idle);
        assert!(engine.source_sizes.lock().expect("sizes").is_empty());
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn raw_scans_are_downsampled_before_registration() -> Result<(), Box<dyn Error>> {
        let mut config = Config::default();
        config.preprocess.voxel_edge_length = 1.0;
        let (node, engine) = spawn(&config);
        let mut reader = node.health_reader();
        node.load_map(map()).await?;

        let raw = scan(
            1,
            vec![
                Point3::new(0.1, 0.1, 0.1),
                Point3::new(0.2, 0.2, 0.2),
                Point3::new(0.3, 0.3, 0.3),
                Point3::new(500.0, 0.0, 0.0),
            ],
        );
        node.submit_raw_scan(&raw).await?;
        wait_for(&mut reader, |s| s.accepted_poses == 1).await?;

        assert_eq!(*engine.source_sizes.lock().expect("sizes"), vec![1]);
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_drains_queued_scans() -> Result<(), Box<dyn Error>> {
        let (node, _) = spawn(&Config::default());
        let reader = node.health_reader();
        node.load_map(map()).await?;

        for seq in 0..3 {
            node.submit_scan(scan(seq, vec![Point3::new(1.0, 0.0, 0.0)])).await?;
        }
        node.shutdown().await?;

        let snap = reader.snapshot();
        assert_eq!(snap.accepted_poses, 3);
        assert_eq!(snap.seq, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_map_build_is_reported() -> Result<(), Box<dyn Error>> {
        let (node, _) = spawn(&Config::default());
        let bad = PointCloud::from_points(vec![Point3::new(f32::NAN, 0.0, 0.0)]);

        let result = node.load_map(bad).await;
        assert!(matches!(result, Err(LocError::MapBuild(_))));
        assert_eq!(node.health().state, LocalizerState::Idle);
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn diagnostics_report_missing_map() -> Result<(), Box<dyn Error>> {
        let (node, _) = spawn(&Config::default());
        let mut diagnostics = node.bus().subscribe_to(Topic::Diagnostics);

        let event = tokio::time::timeout(Duration::from_secs(2), diagnostics.recv()).await??;
        match event.payload {
            EventPayload::Diagnostics(report) => {
                assert_eq!(report.name, "ndt_scan_matcher");
                assert_eq!(report.level, DiagnosticLevel::Warning);
                assert_eq!(report.message, "No map loaded.");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        node.shutdown().await?;
        Ok(())
    }
}
