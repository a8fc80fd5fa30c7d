//! Merge engine: collapses bursts of near-duplicate detections into one
//! alert per key and hands finished alerts to an [`AlertSink`].
//!
//! All group bookkeeping happens under one mutex. Flush timers are tokio
//! tasks that re-check the group's generation before acting, so a timer
//! that lost a race with a newer event or a quick-send is a no-op.

pub mod group;
mod key;
pub mod storage;
pub mod video;

pub use key::{DetectionEvent, merge_key};
#[cfg(test)]
pub(crate) use key::sample_event;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use self::group::{MergeGroup, flush_delay, max_duration};
use self::storage::ObjectStorage;
use self::video::{Frame, FrameRingBuffer, package_clip};
use crate::core::compensation::backoff::capped_exponential;
use crate::core::config::{MergeConfig, PipelineConfig, VideoConfig};
use crate::core::error::PipelineError;
use crate::core::transport::message::AlertPayload;

/// Downstream of the merge engine.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn hand_off(&self, alert: AlertPayload) -> Result<(), PipelineError>;
}

#[derive(Default)]
struct MergeCounters {
    submitted: AtomicU64,
    merged: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    clips: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeStatus {
    pub enabled: bool,
    pub accepting: bool,
    pub active_groups: usize,
    pub active_by_level: BTreeMap<u8, usize>,
    pub buffered_tasks: usize,
    pub submitted: u64,
    pub merged: u64,
    pub flushed: u64,
    pub dropped: u64,
    pub clips: u64,
}

struct EngineState {
    groups: HashMap<String, MergeGroup>,
    buffers: HashMap<i64, FrameRingBuffer>,
    accepting: bool,
    next_generation: u64,
}

impl EngineState {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct EngineInner {
    config: MergeConfig,
    video: VideoConfig,
    video_prefix: String,
    state: Mutex<EngineState>,
    sink: Arc<dyn AlertSink>,
    storage: Arc<dyn ObjectStorage>,
    runtime: Handle,
    tracker: TaskTracker,
    counters: MergeCounters,
}

#[derive(Clone)]
pub struct MergeEngine {
    inner: Arc<EngineInner>,
}

impl MergeEngine {
    /// Must be called from within a tokio runtime; timers and flushes are
    /// spawned on it.
    pub fn new(
        config: &PipelineConfig,
        sink: Arc<dyn AlertSink>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|_| anyhow!("merge engine needs a tokio runtime"))?;
        info!(
            "Merge engine: window={}s, max_duration={}s, quick_send={}, immediate_levels={:?}",
            config.merge.merge_window_seconds,
            config.merge.max_duration_seconds,
            config.merge.quick_send_threshold,
            config.merge.immediate_dispatch_levels
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config: config.merge.clone(),
                video: config.video.clone(),
                video_prefix: config.storage.video_prefix.clone(),
                state: Mutex::new(EngineState {
                    groups: HashMap::new(),
                    buffers: HashMap::new(),
                    accepting: true,
                    next_generation: 0,
                }),
                sink,
                storage,
                runtime,
                tracker: TaskTracker::new(),
                counters: MergeCounters::default(),
            }),
        })
    }

    /// Accept one detection. Returns `Ok(false)` once the engine has been
    /// shut down.
    pub fn submit(
        &self,
        event: DetectionEvent,
        evidence_ref: Option<String>,
    ) -> Result<bool, PipelineError> {
        let inner = &self.inner;
        let mut state = inner.lock_state()?;
        if !state.accepting {
            debug!("Merge engine stopped, rejecting event for task {}", event.task_id);
            return Ok(false);
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let key = merge_key(&event);
        let level = event.alert_level;
        let now = Instant::now();

        if !inner.config.enabled || inner.config.is_immediate(level) {
            let mut group = MergeGroup::new(key, event, evidence_ref, now);
            group.is_sent = true;
            debug!("Level {} event dispatched without merging", level);
            inner.spawn_flush(group, inner.config.minimal_delay());
            return Ok(true);
        }

        let cap = max_duration(&inner.config, &inner.video, level);
        let window = inner.config.merge_window();
        let mergeable = state.groups.get(&key).is_some_and(|g| {
            let age = g.age(now);
            age < cap && age <= window
        });

        if mergeable {
            if let Some(group) = state.groups.get_mut(&key) {
                group.push(&event, evidence_ref);
            }
            inner.counters.merged.fetch_add(1, Ordering::Relaxed);
        } else {
            if let Some(mut stale) = state.groups.remove(&key) {
                stale.close();
                debug!(
                    "Group {} left its merge window, flushing {} instance(s)",
                    key,
                    stale.count()
                );
                inner.spawn_flush(stale, Duration::ZERO);
            }
            state
                .groups
                .insert(key.clone(), MergeGroup::new(key.clone(), event, evidence_ref, now));
        }

        let count = state.groups.get(&key).map(|g| g.count()).unwrap_or(0);
        if count >= inner.config.quick_send_threshold {
            if let Some(mut group) = state.groups.remove(&key) {
                group.close();
                info!(
                    "Quick-send threshold reached for {} ({} instances)",
                    key, count
                );
                inner.spawn_flush(group, inner.config.minimal_delay());
            }
        } else {
            let generation = state.bump_generation();
            if let Some(group) = state.groups.get_mut(&key) {
                EngineInner::arm_timer(inner, group, generation, now);
            }
        }
        Ok(true)
    }

    /// Feed the per-task frame ring used for alert clips.
    pub fn add_frame(
        &self,
        task_id: i64,
        bytes: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        if !inner.video.enabled {
            return Ok(());
        }
        let mut state = inner.lock_state()?;
        state
            .buffers
            .entry(task_id)
            .or_insert_with(|| FrameRingBuffer::new(inner.video.buffer_seconds, inner.video.fps))
            .push(Frame {
                timestamp: Utc::now(),
                bytes,
                width,
                height,
            });
        Ok(())
    }

    /// Flush every open group of a task and drop its frame buffer.
    pub async fn flush_task(&self, task_id: i64) -> usize {
        let groups: Vec<MergeGroup> = match self.inner.lock_state() {
            Ok(mut state) => {
                let keys: Vec<String> = state
                    .groups
                    .iter()
                    .filter(|(_, g)| g.base.task_id == task_id)
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.iter()
                    .filter_map(|k| state.groups.remove(k))
                    .map(|mut g| {
                        g.close();
                        g
                    })
                    .collect()
            }
            Err(e) => {
                error!("Cannot flush task {}: {}", task_id, e);
                return 0;
            }
        };
        let flushed = groups.len();
        for group in groups {
            self.inner.clone().flush(group).await;
        }
        if let Ok(mut state) = self.inner.lock_state() {
            state.buffers.remove(&task_id);
        }
        info!("Flushed {} group(s) for task {}", flushed, task_id);
        flushed
    }

    /// Stop accepting events, flush every open group and wait for all
    /// in-flight flushes to finish.
    pub async fn flush_all(&self) -> usize {
        let inner = &self.inner;
        let flushed = match inner.lock_state() {
            Ok(mut state) => {
                state.accepting = false;
                let groups: Vec<MergeGroup> = state.groups.drain().map(|(_, g)| g).collect();
                let n = groups.len();
                for mut group in groups {
                    group.close();
                    inner.spawn_flush(group, Duration::ZERO);
                }
                n
            }
            Err(e) => {
                error!("Cannot flush merge groups: {}", e);
                0
            }
        };
        inner.tracker.close();
        inner.tracker.wait().await;
        if let Ok(mut state) = inner.lock_state() {
            state.buffers.clear();
        }
        info!("Merge engine drained ({} open group(s) flushed)", flushed);
        flushed
    }

    pub fn status(&self) -> MergeStatus {
        let c = &self.inner.counters;
        let (accepting, active_groups, active_by_level, buffered_tasks) =
            match self.inner.lock_state() {
                Ok(state) => {
                    let mut by_level = BTreeMap::new();
                    for group in state.groups.values() {
                        *by_level.entry(group.level()).or_insert(0) += 1;
                    }
                    (
                        state.accepting,
                        state.groups.len(),
                        by_level,
                        state.buffers.len(),
                    )
                }
                Err(_) => (false, 0, BTreeMap::new(), 0),
            };
        MergeStatus {
            enabled: self.inner.config.enabled,
            accepting,
            active_groups,
            active_by_level,
            buffered_tasks,
            submitted: c.submitted.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            clips: c.clips.load(Ordering::Relaxed),
        }
    }
}

impl EngineInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>, PipelineError> {
        self.state
            .lock()
            .map_err(|_| PipelineError::PermanentFailure("merge state lock poisoned".to_string()))
    }

    fn spawn_flush(self: &Arc<Self>, group: MergeGroup, delay: Duration) {
        let engine = self.clone();
        self.tracker.spawn_on(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                engine.flush(group).await;
            },
            &self.runtime,
        );
    }

    /// (Re)arm the flush timer. The deadline never passes the group's
    /// max duration.
    fn arm_timer(self: &Arc<Self>, group: &mut MergeGroup, generation: u64, now: Instant) {
        if let Some(old) = group.timer.take() {
            old.abort();
        }
        group.generation = generation;
        let delay = flush_delay(&self.config, group.level(), group.count());
        let cap = max_duration(&self.config, &self.video, group.level());
        let deadline = (now + delay).min(group.first_seen + cap);

        let engine = self.clone();
        let key = group.key.clone();
        group.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            engine.on_timer(&key, generation);
        }));
    }

    fn on_timer(self: &Arc<Self>, key: &str, generation: u64) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        let current = state
            .groups
            .get(key)
            .is_some_and(|g| g.generation == generation && !g.is_sent);
        if !current {
            return;
        }
        if let Some(mut group) = state.groups.remove(key) {
            // this task is the timer; drop its handle instead of aborting it
            drop(group.timer.take());
            group.is_sent = true;
            // spawned under the lock so a concurrent flush_all sees it tracked
            self.spawn_flush(group, Duration::ZERO);
        }
    }

    async fn flush(self: Arc<Self>, group: MergeGroup) {
        let mut payload = group.build_payload();
        payload.video_ref = self.build_clip(&group, &payload.alert_id).await;

        let attempts = self.config.handoff_attempts.max(1);
        for attempt in 0..attempts {
            match self.sink.hand_off(payload.clone()).await {
                Ok(()) => {
                    self.counters.flushed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Flushed group {} as alert {} (count={}, {:.1}s)",
                        group.key, payload.alert_id, payload.count, payload.duration_seconds
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Hand-off of alert {} failed (attempt {}/{}): {}",
                        payload.alert_id,
                        attempt + 1,
                        attempts,
                        e
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(capped_exponential(
                            self.config.handoff_backoff_base_ms,
                            self.config.handoff_backoff_cap_ms,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            "Dropped alert {} for group {} ({} detection(s)) after {} failed hand-off attempt(s)",
            payload.alert_id, group.key, payload.count, attempts
        );
    }

    async fn build_clip(&self, group: &MergeGroup, alert_id: &str) -> Option<String> {
        if !self.video.enabled {
            return None;
        }
        let (pre, post) = self.video.clip_window(group.level());
        let start = group.first_timestamp - ChronoDuration::milliseconds((pre * 1000.0) as i64);
        let end = group.last_timestamp + ChronoDuration::milliseconds((post * 1000.0) as i64);
        let task_id = group.base.task_id;
        let frames = {
            let state = self.lock_state().ok()?;
            state.buffers.get(&task_id)?.frames_between(start, end)
        };
        if frames.is_empty() {
            return None;
        }

        let fps = self.video.fps;
        let id = alert_id.to_string();
        let bytes =
            match tokio::task::spawn_blocking(move || package_clip(task_id, &id, fps, &frames))
                .await
            {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    warn!("Clip packaging for alert {} failed: {}", alert_id, e);
                    return None;
                }
                Err(e) => {
                    warn!("Clip packaging task for alert {} panicked: {}", alert_id, e);
                    return None;
                }
            };

        let name = format!("{}{}/{}.tar.gz", self.video_prefix, task_id, alert_id);
        match self.storage.upload(bytes, &name, "application/gzip").await {
            Ok(reference) => {
                self.counters.clips.fetch_add(1, Ordering::Relaxed);
                Some(reference)
            }
            Err(e) => {
                warn!("Clip upload for alert {} failed, sending without video: {}", alert_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::storage::LocalObjectStorage;
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct RecordingSink {
        alerts: Mutex<Vec<AlertPayload>>,
        calls: AtomicU32,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                alerts: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                fail,
            })
        }

        fn counts(&self) -> Vec<u32> {
            self.alerts.lock().unwrap().iter().map(|a| a.count).collect()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn hand_off(&self, alert: AlertPayload) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Storage("disk full".into()));
            }
            self.alerts.lock().unwrap().push(alert);
            Ok(())
        }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.merge.minimal_delay_seconds = 0.05;
        config.merge.base_delay_seconds = 0.2;
        config.merge.level_delay_factor = 0.0;
        config.merge.quick_send_threshold = 3;
        config.merge.handoff_backoff_base_ms = 10;
        config.merge.handoff_backoff_cap_ms = 20;
        config
    }

    fn engine(config: &PipelineConfig, sink: Arc<RecordingSink>) -> (MergeEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStorage::new(dir.path().to_path_buf()));
        (MergeEngine::new(config, sink, storage).unwrap(), dir)
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn quick_send_closes_group_and_rest_start_fresh() {
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&test_config(), sink.clone());
        for _ in 0..5 {
            assert!(engine.submit(sample_event(3), None).unwrap());
        }
        wait_for(|| sink.counts() == vec![3]).await;
        let status = engine.status();
        assert_eq!(status.active_groups, 1);
        assert_eq!(status.merged, 3);

        engine.flush_all().await;
        assert_eq!(sink.counts(), vec![3, 2]);
    }

    #[tokio::test]
    async fn immediate_level_bypasses_base_delay() {
        let mut config = test_config();
        config.merge.base_delay_seconds = 3.0;
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&config, sink.clone());

        let started = Instant::now();
        engine.submit(sample_event(1), Some("local://f.jpg".into())).unwrap();
        wait_for(|| sink.counts() == vec![1]).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.status().active_groups, 0);
    }

    #[tokio::test]
    async fn timer_flushes_merged_group_once() {
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&test_config(), sink.clone());
        engine.submit(sample_event(3), None).unwrap();
        engine.submit(sample_event(3), None).unwrap();
        wait_for(|| sink.counts() == vec![2]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.counts(), vec![2]);
        assert_eq!(engine.status().active_groups, 0);
    }

    #[tokio::test]
    async fn event_outside_window_flushes_previous_group() {
        let mut config = test_config();
        config.merge.merge_window_seconds = 0.1;
        config.merge.base_delay_seconds = 1.0;
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&config, sink.clone());

        engine.submit(sample_event(3), None).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.submit(sample_event(3), None).unwrap();
        wait_for(|| sink.counts() == vec![1]).await;
        assert_eq!(engine.status().active_groups, 1);
    }

    #[tokio::test]
    async fn group_never_outlives_max_duration() {
        let mut config = test_config();
        config.merge.base_delay_seconds = 5.0;
        config.merge.merge_window_seconds = 10.0;
        config.merge.max_duration_seconds = 0.3;
        config.merge.critical_max_duration_seconds = 0.3;
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&config, sink.clone());

        let started = Instant::now();
        engine.submit(sample_event(3), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.submit(sample_event(3), None).unwrap();
        wait_for(|| sink.counts() == vec![2]).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn failing_sink_drops_after_bounded_attempts() {
        let mut config = test_config();
        config.merge.handoff_attempts = 2;
        let sink = RecordingSink::new(true);
        let (engine, _dir) = engine(&config, sink.clone());

        engine.submit(sample_event(1), None).unwrap();
        wait_for(|| engine.status().dropped == 1).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.status().flushed, 0);
    }

    #[tokio::test]
    async fn buffered_frames_become_a_clip() {
        let sink = RecordingSink::new(false);
        let (engine, dir) = engine(&test_config(), sink.clone());
        for i in 0..3u8 {
            engine.add_frame(7, vec![i; 8], 320, 240).unwrap();
        }
        engine.submit(sample_event(1), None).unwrap();
        wait_for(|| sink.counts().len() == 1).await;

        let alert = sink.alerts.lock().unwrap()[0].clone();
        let reference = alert.video_ref.expect("clip reference");
        let expected = format!("local://alert-videos/7/{}.tar.gz", alert.alert_id);
        assert_eq!(reference, expected);
        assert!(dir.path().join(format!("alert-videos/7/{}.tar.gz", alert.alert_id)).exists());
        assert_eq!(engine.status().clips, 1);
    }

    #[tokio::test]
    async fn flush_task_drains_only_that_task() {
        let mut config = test_config();
        config.merge.base_delay_seconds = 5.0;
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&config, sink.clone());

        engine.submit(sample_event(3), None).unwrap();
        let mut other = sample_event(3);
        other.task_id = 99;
        engine.submit(other, None).unwrap();

        assert_eq!(engine.flush_task(7).await, 1);
        assert_eq!(sink.counts(), vec![1]);
        assert_eq!(engine.status().active_groups, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let sink = RecordingSink::new(false);
        let (engine, _dir) = engine(&test_config(), sink.clone());
        engine.flush_all().await;
        assert!(!engine.submit(sample_event(3), None).unwrap());
        assert!(!engine.status().accepting);
    }
}
