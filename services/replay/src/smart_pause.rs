//! Smart Pause: pick the sharpest frame in the recent lookback window and pause
//! playback on it.
//!
//! A run moves through
//! `Idle -> CollectingWindow -> Recovering? -> Scoring? -> Selecting -> Seeking -> Done | Failed`
//! and always ends in a [`SmartPauseDiagnostics`] record. A newer request
//! supersedes an in-flight one; the superseded run stops at its next check and
//! its diagnostics are discarded.

use crate::error::SmartPauseFailure;
use crate::frame::{to_chrono, FrameEntry};
use crate::playback::{PlaybackEngine, SeekCommand, SeekError, SeekMode};
use crate::scorer::{FocusAlgorithm, FocusScorer, FrameScore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MIN_LOOKBACK: Duration = Duration::from_secs(1);
pub const MAX_LOOKBACK: Duration = Duration::from_secs(5);

/// Source of "now" for window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Read access to the buffer tiers for the duration of a run.
pub trait FrameWindowSource: Send + Sync {
    /// RAM frames captured in `[from, to]`, increasing sequence order.
    fn ram_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<FrameEntry>>;

    /// Whether the disk tier holds anything captured in `[from, to]`.
    fn disk_covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool;

    /// Disk frames captured in `[from, to]`, increasing sequence order.
    fn disk_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<FrameEntry>;
}

/// Clamp a lookback into the supported 1-5s range.
pub fn clamp_lookback(lookback: Duration) -> Duration {
    lookback.clamp(MIN_LOOKBACK, MAX_LOOKBACK)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmartPauseSettings {
    pub lookback: Duration,
    pub nominal_fps: f64,
    /// On-demand scoring cap per pass; `None` means the expected frame count
    pub max_scoring_attempts: Option<usize>,
    pub warmup: Duration,
    /// Wall-clock limit on on-demand scoring per pass
    pub scoring_timeout: Option<Duration>,
    pub backfill: bool,
}

impl SmartPauseSettings {
    pub fn new(lookback: Duration, nominal_fps: f64) -> Self {
        Self {
            lookback: clamp_lookback(lookback),
            nominal_fps,
            max_scoring_attempts: None,
            warmup: Duration::from_millis(200),
            scoring_timeout: None,
            backfill: true,
        }
    }

    /// Frames a full window holds at the nominal frame rate.
    pub fn expected_frames(&self) -> usize {
        (self.lookback.as_secs_f64() * self.nominal_fps).round().max(1.0) as usize
    }

    pub fn attempt_cap(&self) -> usize {
        self.max_scoring_attempts
            .unwrap_or_else(|| self.expected_frames())
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmartPauseState {
    Idle,
    CollectingWindow,
    Recovering,
    Scoring,
    Selecting,
    Seeking,
    Done,
    Failed,
}

/// The frame a run landed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartPauseSelection {
    pub sequence: u64,
    pub score: f64,
    pub algorithm: FocusAlgorithm,
    pub captured_at: DateTime<Utc>,
    pub frame_age_ms: u64,
    pub playback_offset_ms: Option<u64>,
}

/// Immutable record of one run, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartPauseDiagnostics {
    pub run_id: Uuid,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub lookback_ms: u64,
    pub seek_mode: SeekMode,
    pub frames_before_recovery: usize,
    pub frames_after_recovery: usize,
    pub backfill_attempted: bool,
    pub scoring_attempts: usize,
    pub scoring_failures: usize,
    pub cached_scores_used: usize,
    pub scoring_timed_out: bool,
    pub warmup_applied: bool,
    pub selection: Option<SmartPauseSelection>,
    pub seek_succeeded: bool,
    pub failure: Option<SmartPauseFailure>,
}

impl SmartPauseDiagnostics {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.seek_succeeded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmartPauseOutcome {
    Completed(SmartPauseDiagnostics),
    /// A newer request took over; no diagnostics were emitted.
    Superseded,
}

impl SmartPauseOutcome {
    pub fn diagnostics(&self) -> Option<&SmartPauseDiagnostics> {
        match self {
            SmartPauseOutcome::Completed(diagnostics) => Some(diagnostics),
            SmartPauseOutcome::Superseded => None,
        }
    }
}

/// Observer of Smart Pause runs.
pub trait SmartPauseListener: Send + Sync {
    fn on_state_change(&self, _state: SmartPauseState) {}

    /// The frame playback was paused on.
    fn on_frame_selected(&self, _frame: &Arc<FrameEntry>, _score: &FrameScore) {}

    fn on_diagnostics(&self, _diagnostics: &SmartPauseDiagnostics) {}
}

/// Highest score wins; equal scores go to the largest sequence.
pub fn select_sharpest(scores: &[FrameScore]) -> Option<FrameScore> {
    scores.iter().copied().max_by(|a, b| {
        a.value
            .total_cmp(&b.value)
            .then_with(|| a.sequence.cmp(&b.sequence))
    })
}

fn failure_label(failure: &SmartPauseFailure) -> &'static str {
    match failure {
        SmartPauseFailure::NoFramesAvailable => "no_frames_available",
        SmartPauseFailure::NoSeekCapability => "no_seek_capability",
        SmartPauseFailure::SeekFailed(_) => "seek_failed",
        SmartPauseFailure::ScoringUnavailable => "scoring_unavailable",
    }
}

/// What one collect-and-score pass found.
#[derive(Default)]
struct Pass {
    candidates: BTreeMap<u64, Arc<FrameEntry>>,
    before_recovery: usize,
    backfill_attempted: bool,
    scores: Vec<FrameScore>,
    attempts: usize,
    failures: usize,
    cached: usize,
    timed_out: bool,
    superseded: bool,
}

struct PassContext {
    source: Arc<dyn FrameWindowSource>,
    scorer: Arc<FocusScorer>,
    settings: SmartPauseSettings,
    generation: Arc<AtomicU64>,
    run: u64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    state: Arc<RwLock<SmartPauseState>>,
    listeners: Vec<Arc<dyn SmartPauseListener>>,
}

impl PassContext {
    fn superseded(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.run
    }

    fn enter(&self, state: SmartPauseState) {
        if self.superseded() {
            return;
        }
        *self.state.write() = state;
        for listener in &self.listeners {
            listener.on_state_change(state);
        }
    }

    /// Collect the window, backfill when short, then score newest first.
    fn run(self) -> Pass {
        let mut pass = Pass::default();

        for entry in self.source.ram_window(self.from, self.to) {
            pass.candidates.insert(entry.sequence, entry);
        }
        pass.before_recovery = pass.candidates.len();

        let expected = self.settings.expected_frames();
        if self.settings.backfill
            && pass.candidates.len() < expected
            && self.source.disk_covers(self.from, self.to)
        {
            self.enter(SmartPauseState::Recovering);
            pass.backfill_attempted = true;
            for entry in self.source.disk_window(self.from, self.to) {
                pass.candidates
                    .entry(entry.sequence)
                    .or_insert_with(|| Arc::new(entry));
            }
            debug!(
                before = pass.before_recovery,
                after = pass.candidates.len(),
                expected,
                "Backfilled lookback window from disk"
            );
        }

        if self.superseded() {
            pass.superseded = true;
            return pass;
        }

        let cap = self.settings.attempt_cap();
        let deadline = self.settings.scoring_timeout.map(|t| Instant::now() + t);
        let mut entered_scoring = false;

        for entry in pass.candidates.values().rev() {
            if let Some(score) = self.scorer.cached(entry.sequence) {
                pass.cached += 1;
                pass.scores.push(score);
                continue;
            }
            if pass.attempts >= cap || pass.timed_out {
                continue;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                pass.timed_out = true;
                continue;
            }
            if self.superseded() {
                pass.superseded = true;
                return pass;
            }
            if !entered_scoring {
                self.enter(SmartPauseState::Scoring);
                entered_scoring = true;
            }

            pass.attempts += 1;
            match self.scorer.score_entry(entry) {
                Ok(score) => pass.scores.push(score),
                Err(e) => {
                    pass.failures += 1;
                    debug!(sequence = entry.sequence, error = %e, "On-demand scoring failed");
                }
            }
        }

        pass
    }
}

/// Orchestrates Smart Pause runs against the buffer, scorer and engine.
pub struct SmartPauseCoordinator {
    source: Arc<dyn FrameWindowSource>,
    scorer: Arc<FocusScorer>,
    engine: Arc<dyn PlaybackEngine>,
    clock: Arc<dyn Clock>,
    settings: SmartPauseSettings,
    listeners: RwLock<Vec<Arc<dyn SmartPauseListener>>>,
    generation: Arc<AtomicU64>,
    state: Arc<RwLock<SmartPauseState>>,
    last: RwLock<Option<SmartPauseDiagnostics>>,
}

impl SmartPauseCoordinator {
    pub fn new(
        source: Arc<dyn FrameWindowSource>,
        scorer: Arc<FocusScorer>,
        engine: Arc<dyn PlaybackEngine>,
        settings: SmartPauseSettings,
    ) -> Self {
        Self {
            source,
            scorer,
            engine,
            clock: Arc::new(SystemClock),
            settings,
            listeners: RwLock::new(Vec::new()),
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(RwLock::new(SmartPauseState::Idle)),
            last: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn SmartPauseListener>) {
        self.listeners.write().push(listener);
    }

    pub fn settings(&self) -> &SmartPauseSettings {
        &self.settings
    }

    /// State of the most recent run.
    pub fn state(&self) -> SmartPauseState {
        *self.state.read()
    }

    pub fn last_diagnostics(&self) -> Option<SmartPauseDiagnostics> {
        self.last.read().clone()
    }

    /// Run Smart Pause. Supersedes any run still in flight.
    pub async fn request(&self) -> SmartPauseOutcome {
        let run = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let requested_at = self.clock.now();
        let seek_mode = self.engine.seek_mode();

        let mut diagnostics = SmartPauseDiagnostics {
            run_id: Uuid::new_v4(),
            requested_at,
            completed_at: requested_at,
            lookback_ms: self.settings.lookback.as_millis() as u64,
            seek_mode,
            frames_before_recovery: 0,
            frames_after_recovery: 0,
            backfill_attempted: false,
            scoring_attempts: 0,
            scoring_failures: 0,
            cached_scores_used: 0,
            scoring_timed_out: false,
            warmup_applied: false,
            selection: None,
            seek_succeeded: false,
            failure: None,
        };
        info!(run_id = %diagnostics.run_id, seek_mode = %seek_mode, "Smart Pause requested");

        if seek_mode == SeekMode::Disabled {
            return self.finish(run, diagnostics, Some(SmartPauseFailure::NoSeekCapability));
        }

        let mut pass = match self.collect(run).await {
            Some(pass) => pass,
            None => return SmartPauseOutcome::Superseded,
        };

        if pass.scores.is_empty() && !self.settings.warmup.is_zero() {
            debug!(
                warmup_ms = self.settings.warmup.as_millis() as u64,
                "No scorable frames, waiting for warm-up"
            );
            diagnostics.warmup_applied = true;
            tokio::time::sleep(self.settings.warmup).await;
            if !self.is_current(run) {
                return SmartPauseOutcome::Superseded;
            }
            let first_attempts = pass.attempts;
            let first_failures = pass.failures;
            pass = match self.collect(run).await {
                Some(retry) => retry,
                None => return SmartPauseOutcome::Superseded,
            };
            pass.attempts += first_attempts;
            pass.failures += first_failures;
        }

        diagnostics.frames_before_recovery = pass.before_recovery;
        diagnostics.frames_after_recovery = pass.candidates.len();
        diagnostics.backfill_attempted = pass.backfill_attempted;
        diagnostics.scoring_attempts = pass.attempts;
        diagnostics.scoring_failures = pass.failures;
        diagnostics.cached_scores_used = pass.cached;
        diagnostics.scoring_timed_out = pass.timed_out;

        if pass.scores.is_empty() {
            let failure = if pass.candidates.is_empty() {
                SmartPauseFailure::NoFramesAvailable
            } else {
                SmartPauseFailure::ScoringUnavailable
            };
            return self.finish(run, diagnostics, Some(failure));
        }

        self.enter(run, SmartPauseState::Selecting);
        let Some(best) = select_sharpest(&pass.scores) else {
            return self.finish(run, diagnostics, Some(SmartPauseFailure::ScoringUnavailable));
        };
        let Some(frame) = pass.candidates.get(&best.sequence).cloned() else {
            return self.finish(run, diagnostics, Some(SmartPauseFailure::NoFramesAvailable));
        };

        let now = self.clock.now();
        let age = frame.age_at(now);
        diagnostics.selection = Some(SmartPauseSelection {
            sequence: best.sequence,
            score: best.value,
            algorithm: best.algorithm,
            captured_at: frame.captured_at,
            frame_age_ms: age.as_millis() as u64,
            playback_offset_ms: frame.playback_offset.map(|o| o.as_millis() as u64),
        });

        self.enter(run, SmartPauseState::Seeking);
        let command = match seek_mode {
            SeekMode::Absolute => match frame.playback_offset {
                Some(position) => Ok(SeekCommand::SeekAndPause { position }),
                None => Err(SeekError::NoPosition),
            },
            SeekMode::LiveBuffered => Ok(SeekCommand::SeekBackAndPause { offset: age }),
            SeekMode::Disabled => {
                return self.finish(run, diagnostics, Some(SmartPauseFailure::NoSeekCapability))
            }
        };
        let result = match command {
            Ok(command) => self.engine.seek_and_pause(command).await,
            Err(e) => Err(e),
        };

        if !self.is_current(run) {
            return SmartPauseOutcome::Superseded;
        }

        match result {
            Ok(()) => {
                diagnostics.seek_succeeded = true;
                for listener in self.listeners.read().iter() {
                    listener.on_frame_selected(&frame, &best);
                }
                self.finish(run, diagnostics, None)
            }
            Err(e) => {
                warn!(sequence = best.sequence, error = %e, "Seek failed");
                self.finish(run, diagnostics, Some(SmartPauseFailure::SeekFailed(e.to_string())))
            }
        }
    }

    /// One collect-and-score pass off the async runtime. `None` if superseded.
    async fn collect(&self, run: u64) -> Option<Pass> {
        self.enter(run, SmartPauseState::CollectingWindow);

        let to = self.clock.now();
        let from = to - to_chrono(self.settings.lookback);
        let context = PassContext {
            source: self.source.clone(),
            scorer: self.scorer.clone(),
            settings: self.settings.clone(),
            generation: self.generation.clone(),
            run,
            from,
            to,
            state: self.state.clone(),
            listeners: self.listeners.read().clone(),
        };

        let pass = match tokio::task::spawn_blocking(move || context.run()).await {
            Ok(pass) => pass,
            Err(e) => {
                warn!(error = %e, "Smart Pause scoring pass aborted");
                Pass::default()
            }
        };
        if pass.superseded || !self.is_current(run) {
            return None;
        }
        Some(pass)
    }

    fn is_current(&self, run: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == run
    }

    fn enter(&self, run: u64, state: SmartPauseState) {
        if !self.is_current(run) {
            return;
        }
        *self.state.write() = state;
        for listener in self.listeners.read().iter() {
            listener.on_state_change(state);
        }
    }

    fn finish(
        &self,
        run: u64,
        mut diagnostics: SmartPauseDiagnostics,
        failure: Option<SmartPauseFailure>,
    ) -> SmartPauseOutcome {
        if !self.is_current(run) {
            return SmartPauseOutcome::Superseded;
        }

        diagnostics.completed_at = self.clock.now();
        diagnostics.failure = failure;

        match &diagnostics.failure {
            None => {
                metrics::counter!("replay.smart_pause.runs", "result" => "success").increment(1);
                info!(
                    run_id = %diagnostics.run_id,
                    sequence = diagnostics.selection.as_ref().map(|s| s.sequence),
                    attempts = diagnostics.scoring_attempts,
                    "Smart Pause completed"
                );
                self.enter(run, SmartPauseState::Done);
            }
            Some(failure) => {
                metrics::counter!("replay.smart_pause.runs", "result" => failure_label(failure))
                    .increment(1);
                info!(run_id = %diagnostics.run_id, failure = %failure, "Smart Pause failed");
                self.enter(run, SmartPauseState::Failed);
            }
        }

        *self.last.write() = Some(diagnostics.clone());
        for listener in self.listeners.read().iter() {
            listener.on_diagnostics(&diagnostics);
        }
        SmartPauseOutcome::Completed(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::FrameCompressor;
    use crate::frame::{FrameTier, PixelFormat, RawFrame};
    use crate::scorer::{LumaPlane, SharpnessMetric};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Frame `sequence` captured `ago_ms` before `now()`.
    fn frame(sequence: u64, ago_ms: i64) -> FrameEntry {
        let raw = RawFrame::new(
            sequence,
            now() - chrono::Duration::milliseconds(ago_ms),
            8,
            8,
            PixelFormat::Gray8,
            (0..64).map(|i| if i % 2 == 0 { 10u8 } else { 240 }).collect::<Vec<u8>>(),
        )
        .with_playback_offset(Duration::from_millis(sequence * 33));
        FrameCompressor::new(80).compress(&raw).unwrap()
    }

    /// `count` frames at 30fps ending at `now()`, first sequence `first`.
    fn frames_at_30fps(first: u64, count: u64, end_ago_ms: i64) -> Vec<FrameEntry> {
        (0..count)
            .map(|i| frame(first + i, end_ago_ms + ((count - 1 - i) as i64 * 33)))
            .collect()
    }

    #[derive(Default)]
    struct StaticSource {
        ram: Vec<FrameEntry>,
        disk: Vec<FrameEntry>,
        /// RAM stays empty for this many calls
        empty_calls: AtomicUsize,
    }

    impl FrameWindowSource for StaticSource {
        fn ram_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<FrameEntry>> {
            if self
                .empty_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Vec::new();
            }
            self.ram
                .iter()
                .filter(|f| f.captured_at >= from && f.captured_at <= to)
                .cloned()
                .map(Arc::new)
                .collect()
        }

        fn disk_covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
            self.disk.iter().any(|f| f.captured_at >= from && f.captured_at <= to)
        }

        fn disk_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<FrameEntry> {
            self.disk
                .iter()
                .filter(|f| f.captured_at >= from && f.captured_at <= to)
                .cloned()
                .map(|f| f.into_tier(FrameTier::Disk(1)))
                .collect()
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        mode: Option<SeekMode>,
        commands: Mutex<Vec<SeekCommand>>,
        reject: bool,
        /// First seek waits here until notified
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl RecordingEngine {
        fn new(mode: SeekMode) -> Self {
            Self {
                mode: Some(mode),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PlaybackEngine for RecordingEngine {
        fn seek_mode(&self) -> SeekMode {
            self.mode.unwrap_or(SeekMode::Absolute)
        }

        async fn seek_and_pause(&self, command: SeekCommand) -> Result<(), SeekError> {
            let first = {
                let mut commands = self.commands.lock();
                commands.push(command);
                commands.len() == 1
            };
            if first {
                if let Some(gate) = &self.gate {
                    self.entered.notify_one();
                    gate.notified().await;
                }
            }
            if self.reject {
                return Err(SeekError::Rejected("busy".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingListener {
        diagnostics: Mutex<Vec<SmartPauseDiagnostics>>,
        selected: Mutex<Vec<u64>>,
        states: Mutex<Vec<SmartPauseState>>,
    }

    impl SmartPauseListener for CollectingListener {
        fn on_state_change(&self, state: SmartPauseState) {
            self.states.lock().push(state);
        }

        fn on_frame_selected(&self, frame: &Arc<FrameEntry>, _score: &FrameScore) {
            self.selected.lock().push(frame.sequence);
        }

        fn on_diagnostics(&self, diagnostics: &SmartPauseDiagnostics) {
            self.diagnostics.lock().push(diagnostics.clone());
        }
    }

    fn score(sequence: u64, value: f64) -> FrameScore {
        FrameScore {
            sequence,
            value,
            algorithm: FocusAlgorithm::Laplacian,
            computed_at: now(),
        }
    }

    fn settings(lookback_secs: u64) -> SmartPauseSettings {
        let mut settings = SmartPauseSettings::new(Duration::from_secs(lookback_secs), 30.0);
        settings.warmup = Duration::from_millis(10);
        settings
    }

    fn coordinator(
        source: StaticSource,
        scorer: Arc<FocusScorer>,
        engine: RecordingEngine,
        settings: SmartPauseSettings,
    ) -> (SmartPauseCoordinator, Arc<CollectingListener>, Arc<RecordingEngine>) {
        let engine = Arc::new(engine);
        let listener = Arc::new(CollectingListener::default());
        let coordinator =
            SmartPauseCoordinator::new(Arc::new(source), scorer, engine.clone(), settings)
                .with_clock(Arc::new(FixedClock(now())));
        coordinator.add_listener(listener.clone());
        (coordinator, listener, engine)
    }

    fn completed(outcome: SmartPauseOutcome) -> SmartPauseDiagnostics {
        match outcome {
            SmartPauseOutcome::Completed(diagnostics) => diagnostics,
            SmartPauseOutcome::Superseded => panic!("run was superseded"),
        }
    }

    #[test]
    fn test_select_sharpest_breaks_ties_by_sequence() {
        let scores = vec![score(3, 5.0), score(7, 9.0), score(5, 9.0), score(1, 2.0)];
        assert_eq!(select_sharpest(&scores).unwrap().sequence, 7);

        let mut reversed = scores.clone();
        reversed.reverse();
        assert_eq!(select_sharpest(&reversed).unwrap().sequence, 7);
        assert!(select_sharpest(&[]).is_none());
    }

    #[test]
    fn test_settings_clamp_and_defaults() {
        let settings = SmartPauseSettings::new(Duration::from_secs(9), 30.0);
        assert_eq!(settings.lookback, MAX_LOOKBACK);
        assert_eq!(settings.expected_frames(), 150);
        assert_eq!(settings.attempt_cap(), 150);

        let short = SmartPauseSettings::new(Duration::from_millis(200), 30.0);
        assert_eq!(short.lookback, MIN_LOOKBACK);
    }

    #[tokio::test]
    async fn test_increasing_scores_select_newest() {
        let source = StaticSource {
            ram: frames_at_30fps(1, 60, 0),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 256));
        for seq in 1..=60 {
            scorer.record(score(seq, seq as f64));
        }
        let (coordinator, listener, engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Absolute), settings(2));

        let diagnostics = completed(coordinator.request().await);
        assert!(diagnostics.is_success());
        let selection = diagnostics.selection.unwrap();
        assert_eq!(selection.sequence, 60);
        assert_eq!(selection.score, 60.0);
        assert_eq!(diagnostics.frames_before_recovery, 60);
        assert_eq!(diagnostics.frames_after_recovery, 60);
        assert_eq!(diagnostics.cached_scores_used, 60);
        assert_eq!(diagnostics.scoring_attempts, 0);
        assert!(!diagnostics.backfill_attempted);
        assert!(!diagnostics.warmup_applied);

        assert_eq!(
            engine.commands.lock().as_slice(),
            &[SeekCommand::SeekAndPause {
                position: Duration::from_millis(60 * 33)
            }]
        );
        assert_eq!(listener.selected.lock().as_slice(), &[60]);
        assert_eq!(listener.diagnostics.lock().len(), 1);
        assert_eq!(coordinator.state(), SmartPauseState::Done);
        assert_eq!(listener.states.lock().last(), Some(&SmartPauseState::Done));
    }

    #[tokio::test]
    async fn test_empty_window_reports_no_frames() {
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 16));
        let (coordinator, listener, engine) = coordinator(
            StaticSource::default(),
            scorer,
            RecordingEngine::new(SeekMode::Absolute),
            settings(2),
        );

        let diagnostics = completed(coordinator.request().await);
        assert_eq!(diagnostics.failure, Some(SmartPauseFailure::NoFramesAvailable));
        assert!(diagnostics.warmup_applied);
        assert!(!diagnostics.seek_succeeded);
        assert!(engine.commands.lock().is_empty());
        assert_eq!(listener.diagnostics.lock().len(), 1);
        assert_eq!(coordinator.state(), SmartPauseState::Failed);
    }

    #[tokio::test]
    async fn test_disabled_seek_mode_never_seeks() {
        let source = StaticSource {
            ram: frames_at_30fps(1, 30, 0),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 64));
        let (coordinator, _listener, engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Disabled), settings(2));

        for _ in 0..3 {
            let diagnostics = completed(coordinator.request().await);
            assert_eq!(diagnostics.failure, Some(SmartPauseFailure::NoSeekCapability));
            assert_eq!(diagnostics.seek_mode, SeekMode::Disabled);
        }
        assert!(engine.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_from_disk_fills_window() {
        // RAM holds the newest second, disk the second before it.
        let all = frames_at_30fps(1, 60, 0);
        let source = StaticSource {
            disk: all[..30].to_vec(),
            ram: all[30..].to_vec(),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 256));
        for seq in 1..=60 {
            scorer.record(score(seq, if seq == 12 { 100.0 } else { 1.0 }));
        }
        let (coordinator, _listener, _engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Absolute), settings(2));

        let diagnostics = completed(coordinator.request().await);
        assert!(diagnostics.backfill_attempted);
        assert_eq!(diagnostics.frames_before_recovery, 30);
        assert_eq!(diagnostics.frames_after_recovery, 60);
        assert_eq!(diagnostics.selection.unwrap().sequence, 12);
    }

    #[tokio::test]
    async fn test_on_demand_scoring_respects_attempt_cap() {
        let source = StaticSource {
            ram: frames_at_30fps(1, 20, 0),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 64));
        let mut settings = settings(2);
        settings.max_scoring_attempts = Some(5);
        settings.backfill = false;
        let (coordinator, _listener, _engine) = coordinator(
            source,
            scorer.clone(),
            RecordingEngine::new(SeekMode::Absolute),
            settings,
        );

        let diagnostics = completed(coordinator.request().await);
        assert_eq!(diagnostics.scoring_attempts, 5);
        assert_eq!(diagnostics.scoring_failures, 0);
        assert_eq!(scorer.cache_len(), 5);
        // Identical content scores equally; the newest scored frame wins.
        assert_eq!(diagnostics.selection.unwrap().sequence, 20);
    }

    #[tokio::test]
    async fn test_scoring_deadline_stops_on_demand_scoring() {
        struct Slow;
        impl SharpnessMetric for Slow {
            fn algorithm(&self) -> FocusAlgorithm {
                FocusAlgorithm::Laplacian
            }
            fn score(&self, _plane: &LumaPlane) -> Option<f64> {
                std::thread::sleep(Duration::from_millis(20));
                Some(1.0)
            }
        }

        let source = StaticSource {
            ram: frames_at_30fps(1, 30, 0),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::with_metric(Arc::new(Slow), 64));
        let mut settings = settings(2);
        settings.scoring_timeout = Some(Duration::from_millis(60));
        settings.backfill = false;
        let cap = settings.attempt_cap();
        let (coordinator, _listener, _engine) = coordinator(
            source,
            scorer,
            RecordingEngine::new(SeekMode::Absolute),
            settings,
        );

        let diagnostics = completed(coordinator.request().await);
        assert!(diagnostics.scoring_timed_out);
        assert!(diagnostics.scoring_attempts >= 1);
        assert!(diagnostics.scoring_attempts < 30);
        assert!(diagnostics.scoring_attempts < cap);
        // Best of what was scored before the deadline: the newest frame.
        assert!(diagnostics.is_success());
        assert_eq!(diagnostics.selection.unwrap().sequence, 30);
    }

    #[tokio::test]
    async fn test_broken_metric_reports_scoring_unavailable() {
        struct Broken;
        impl SharpnessMetric for Broken {
            fn algorithm(&self) -> FocusAlgorithm {
                FocusAlgorithm::Laplacian
            }
            fn score(&self, _plane: &LumaPlane) -> Option<f64> {
                Some(f64::NAN)
            }
        }

        let source = StaticSource {
            ram: frames_at_30fps(1, 10, 0),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::with_metric(Arc::new(Broken), 64));
        let (coordinator, _listener, _engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Absolute), settings(2));

        let diagnostics = completed(coordinator.request().await);
        assert_eq!(diagnostics.failure, Some(SmartPauseFailure::ScoringUnavailable));
        assert!(diagnostics.warmup_applied);
        assert_eq!(diagnostics.scoring_failures, 20);
    }

    #[tokio::test]
    async fn test_warmup_retry_finds_late_frames() {
        let source = StaticSource {
            ram: frames_at_30fps(1, 10, 0),
            empty_calls: AtomicUsize::new(1),
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 64));
        let (coordinator, _listener, _engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Absolute), settings(1));

        let diagnostics = completed(coordinator.request().await);
        assert!(diagnostics.warmup_applied);
        assert!(diagnostics.is_success());
        assert_eq!(diagnostics.frames_before_recovery, 10);
    }

    #[tokio::test]
    async fn test_live_buffered_seeks_relative_to_live_edge() {
        let source = StaticSource {
            ram: vec![frame(1, 900), frame(2, 500)],
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 16));
        scorer.record(score(1, 50.0));
        scorer.record(score(2, 10.0));
        let (coordinator, _listener, engine) = coordinator(
            source,
            scorer,
            RecordingEngine::new(SeekMode::LiveBuffered),
            settings(1),
        );

        let diagnostics = completed(coordinator.request().await);
        let selection = diagnostics.selection.unwrap();
        assert_eq!(selection.sequence, 1);
        assert_eq!(selection.frame_age_ms, 900);
        assert_eq!(
            engine.commands.lock().as_slice(),
            &[SeekCommand::SeekBackAndPause {
                offset: Duration::from_millis(900)
            }]
        );
    }

    #[tokio::test]
    async fn test_absolute_seek_without_position_fails() {
        let mut entry = frame(1, 100);
        entry.playback_offset = None;
        let source = StaticSource {
            ram: vec![entry],
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 16));
        scorer.record(score(1, 5.0));
        let (coordinator, listener, engine) =
            coordinator(source, scorer, RecordingEngine::new(SeekMode::Absolute), settings(1));

        let diagnostics = completed(coordinator.request().await);
        assert!(matches!(diagnostics.failure, Some(SmartPauseFailure::SeekFailed(_))));
        assert_eq!(diagnostics.selection.map(|s| s.sequence), Some(1));
        assert!(engine.commands.lock().is_empty());
        assert!(listener.selected.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_seek_reported() {
        let source = StaticSource {
            ram: vec![frame(1, 100)],
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 16));
        scorer.record(score(1, 5.0));
        let engine = RecordingEngine {
            reject: true,
            ..RecordingEngine::new(SeekMode::Absolute)
        };
        let (coordinator, _listener, _engine) = coordinator(source, scorer, engine, settings(1));

        let diagnostics = completed(coordinator.request().await);
        assert_eq!(
            diagnostics.failure,
            Some(SmartPauseFailure::SeekFailed(
                "Playback engine rejected seek: busy".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_newer_request_supersedes_in_flight_run() {
        let source = StaticSource {
            ram: vec![frame(1, 100)],
            ..Default::default()
        };
        let scorer = Arc::new(FocusScorer::new(FocusAlgorithm::Laplacian, 16));
        scorer.record(score(1, 5.0));
        let gate = Arc::new(Notify::new());
        let engine = RecordingEngine {
            gate: Some(gate.clone()),
            ..RecordingEngine::new(SeekMode::Absolute)
        };
        let (coordinator, listener, engine) = coordinator(source, scorer, engine, settings(1));
        let coordinator = Arc::new(coordinator);

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.request().await }
        });
        engine.entered.notified().await;

        let second = coordinator.request().await;
        assert!(completed(second).is_success());

        gate.notify_one();
        assert_eq!(first.await.unwrap(), SmartPauseOutcome::Superseded);
        assert_eq!(listener.diagnostics.lock().len(), 1);
        assert_eq!(engine.commands.lock().len(), 2);
    }
}
