//! Playback orchestrator.
//!
//! A single task owns all playback state and consumes [`PlayerEvent`]s one at
//! a time. Surfaces, timers and the manifest watcher only ever post events;
//! nothing else mutates the cursor, the transition guard or the surface pools.

use crate::availability::ContentAvailability;
use crate::config::PlaybackConfig;
use crate::error::PrepareError;
use crate::events::{
    InputEvent, Lifecycle, ManifestEvent, ManifestOrigin, PlayerEvent, SurfaceEvent, TimerEvent,
    TimerPurpose,
};
use crate::manifest::{ContentItem, ContentKind, Playlist};
use crate::status::{AvailabilityLabel, StatusDisplay, StatusOverlay};
use crate::surface::{PoolUpdate, SurfaceSet, SurfaceSignal};
use crate::timer::TimerSlot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Coarse playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No playlist yet.
    Loading,
    /// The current item was dispatched to its surface.
    Preparing(ContentKind),
    Playing(ContentKind),
    /// A full lap failed. Only a manual navigation, a new manifest or
    /// returning connectivity restarts playback.
    AllContentFailed,
}

/// Position in the playlist and the kinds involved in the last transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub index: usize,
    pub current_kind: Option<ContentKind>,
    pub previous_kind: Option<ContentKind>,
}

/// Latch preventing re-entrant transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Idle,
    Pending { deadline: Instant },
}

pub struct Orchestrator {
    config: PlaybackConfig,
    surfaces: SurfaceSet,
    availability: Arc<dyn ContentAvailability>,
    status: Box<dyn StatusDisplay>,
    events: mpsc::UnboundedSender<PlayerEvent>,

    playlist: Option<Playlist>,
    origin: ManifestOrigin,
    cursor: PlaybackCursor,
    transition: TransitionState,
    phase: Phase,
    consecutive_errors: usize,

    /// Bumped on every selection; timers armed for older generations are ignored.
    generation: u64,
    next_token: u64,
    advance_timer: TimerSlot,
    deadline_timer: TimerSlot,
    prepare_timer: TimerSlot,

    online: bool,
    foreground: bool,
    user_paused: bool,
}

impl Orchestrator {
    pub fn new(
        config: PlaybackConfig,
        surfaces: SurfaceSet,
        availability: Arc<dyn ContentAvailability>,
        status: Box<dyn StatusDisplay>,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Self {
        Self {
            config,
            surfaces,
            availability,
            status,
            events,
            playlist: None,
            origin: ManifestOrigin::Remote,
            cursor: PlaybackCursor::default(),
            transition: TransitionState::Idle,
            phase: Phase::Loading,
            consecutive_errors: 0,
            generation: 0,
            next_token: 0,
            advance_timer: TimerSlot::default(),
            deadline_timer: TimerSlot::default(),
            prepare_timer: TimerSlot::default(),
            online: true,
            foreground: true,
            user_paused: false,
        }
    }

    /// Called once before the first event.
    pub fn start(&mut self) {
        self.status.show_loading("Loading playlist");
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    pub fn playlist(&self) -> Option<&Playlist> {
        self.playlist.as_ref()
    }

    pub fn current_item(&self) -> Option<&ContentItem> {
        self.playlist.as_ref()?.get(self.cursor.index)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self.transition, TransitionState::Pending { .. })
    }

    pub fn consecutive_errors(&self) -> usize {
        self.consecutive_errors
    }

    pub fn surfaces(&self) -> &SurfaceSet {
        &self.surfaces
    }

    pub fn handle(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Surface(event) => self.on_surface(event),
            PlayerEvent::Timer(event) => self.on_timer(event),
            PlayerEvent::Input(input) => self.on_input(input),
            PlayerEvent::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle),
            PlayerEvent::Manifest(event) => self.on_manifest(event),
        }
    }

    /// Move to the neighbouring item. Dropped if a transition is in progress.
    pub fn advance(&mut self, direction: Direction) -> bool {
        let Some(playlist) = &self.playlist else {
            tracing::debug!("No playlist, ignoring advance {:?}", direction);
            return false;
        };
        if self.is_transitioning() {
            tracing::debug!("Transition in progress, dropping advance {:?}", direction);
            return false;
        }

        let target = match direction {
            Direction::Next => playlist.next_index(self.cursor.index),
            Direction::Previous => playlist.previous_index(self.cursor.index),
        };
        tracing::debug!("Advance {:?}: {} -> {}", direction, self.cursor.index, target);

        self.begin_transition();
        self.select_and_play(target);
        true
    }

    fn begin_transition(&mut self) {
        let deadline = self.config.transition_deadline();
        self.transition = TransitionState::Pending {
            deadline: Instant::now() + deadline,
        };
        self.advance_timer.cancel();
        self.deadline_timer.arm(
            deadline,
            &self.events,
            TimerEvent {
                generation: self.generation,
                purpose: TimerPurpose::TransitionDeadline,
            },
        );
    }

    /// Play the item at `index`, wrapped into range.
    pub fn select_and_play(&mut self, index: usize) {
        let availability = self.availability.clone();
        let Some(playlist) = self.playlist.as_mut() else {
            return;
        };
        let index = playlist.wrap(index);
        let Some(item) = playlist.get_mut(index) else {
            return;
        };
        item.refresh_offline(availability.as_ref());
        let item = item.clone();
        let kind = item.kind;

        self.generation += 1;
        self.advance_timer.cancel();
        self.prepare_timer.cancel();
        self.user_paused = false;

        let same_kind = self.cursor.current_kind == Some(kind);
        self.cursor = PlaybackCursor {
            index,
            current_kind: Some(kind),
            previous_kind: self.cursor.current_kind,
        };
        self.phase = Phase::Preparing(kind);

        tracing::info!(
            "Selecting {} ({}, {}/{}){}",
            item.id,
            kind,
            index + 1,
            self.playlist.as_ref().map_or(0, Playlist::len),
            if same_kind { ", keeping surface" } else { "" }
        );

        for pool in self.surfaces.iter_mut() {
            if pool.kind() != kind {
                pool.clear_all();
            }
        }

        let result = self.dispatch(&item, same_kind);
        self.transition = TransitionState::Idle;

        if let Err(e) = result {
            self.on_prepare_failed(e);
        }
    }

    fn dispatch(&mut self, item: &ContentItem, same_kind: bool) -> Result<(), PrepareError> {
        let kind = item.kind;
        if kind.is_timed() && self.surfaces.get_mut(kind).promote_standby(&item.id) {
            tracing::debug!("Standby surface already holds {}, swapping", item.id);
            self.on_active_ready(kind);
            return Ok(());
        }

        let uri = self.resolve_source(item)?;
        let token = self.issue_token();
        let events = self.events.clone();
        let pool = self.surfaces.get_mut(kind);

        if same_kind && pool.is_presenting() {
            pool.rotate();
        } else {
            pool.hide_all();
            pool.discard_standby();
        }

        tracing::debug!("Preparing {} from {}", item.id, uri);
        let signal = SurfaceSignal::new(kind, pool.active_slot(), token, events);
        pool.load_active(&item.id, &uri, signal);

        self.prepare_timer.arm(
            self.config.prepare_timeout(),
            &self.events,
            TimerEvent {
                generation: self.generation,
                purpose: TimerPurpose::PrepareDeadline,
            },
        );
        Ok(())
    }

    /// Video prefers the local copy; documents and images prefer the live
    /// remote page unless there is none or we are running from the stored
    /// manifest.
    fn resolve_source(&self, item: &ContentItem) -> Result<Url, PrepareError> {
        let remote = Some(item.source_uri.as_str()).filter(|uri| !uri.is_empty());
        let prefer_local = item.kind == ContentKind::Video
            || remote.is_none()
            || self.origin == ManifestOrigin::Cached;

        if prefer_local && item.offline.available {
            match &item.offline.local_uri {
                Some(uri) => return Ok(uri.clone()),
                None => tracing::warn!("Local copy of {} is missing, using remote", item.id),
            }
        }

        let remote = remote.ok_or_else(|| PrepareError::NoSource { id: item.id.clone() })?;
        Url::parse(remote).map_err(|_| PrepareError::InvalidUri {
            id: item.id.clone(),
            uri: remote.to_string(),
        })
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn on_surface(&mut self, event: SurfaceEvent) {
        let update = self
            .surfaces
            .get_mut(event.kind)
            .apply(event.slot, event.token, event.signal);

        match update {
            PoolUpdate::ActiveReady => self.on_active_ready(event.kind),
            PoolUpdate::ActiveFailed(reason) => self.on_prepare_failed(PrepareError::Renderer(reason)),
            PoolUpdate::ActiveEnded => {
                tracing::debug!("Video finished");
                self.advance(Direction::Next);
            }
            PoolUpdate::StandbyReady => {
                tracing::debug!("Prefetched next {} item", event.kind);
            }
            PoolUpdate::StandbyFailed(reason) => {
                tracing::debug!("Prefetch of next {} item failed: {}", event.kind, reason);
            }
            PoolUpdate::Stale => {
                tracing::trace!("Ignoring stale {} signal (token {})", event.kind, event.token);
            }
        }
    }

    fn on_active_ready(&mut self, kind: ContentKind) {
        self.prepare_timer.cancel();
        self.consecutive_errors = 0;
        self.phase = Phase::Playing(kind);

        for pool in self.surfaces.iter_mut() {
            if pool.kind() == kind {
                pool.present_active();
            } else {
                pool.hide_all();
            }
        }
        self.status.hide_loading();

        let Some(item) = self.current_item() else {
            return;
        };
        tracing::info!("Playing {} \"{}\"", item.id, item.title);
        let display_seconds = item.display_seconds;

        if kind.is_timed() {
            let delay = display_seconds
                .map(|seconds| Duration::from_secs(u64::from(seconds.get())))
                .unwrap_or_else(|| self.config.default_display());
            self.advance_timer.arm(
                delay,
                &self.events,
                TimerEvent {
                    generation: self.generation,
                    purpose: TimerPurpose::Advance,
                },
            );
        } else if !self.foreground {
            self.surfaces.get_mut(kind).set_paused(true);
        }

        self.prefetch_next();
    }

    /// Load the next document or image on its standby surface.
    fn prefetch_next(&mut self) {
        let availability = self.availability.clone();
        let Some(playlist) = self.playlist.as_mut() else {
            return;
        };
        if playlist.len() < 2 {
            return;
        }
        let next = playlist.next_index(self.cursor.index);
        let Some(item) = playlist.get_mut(next) else {
            return;
        };
        if !item.kind.is_timed() {
            return;
        }
        item.refresh_offline(availability.as_ref());
        let item = item.clone();

        let uri = match self.resolve_source(&item) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::debug!("Not prefetching: {}", e);
                return;
            }
        };
        let token = self.issue_token();
        let events = self.events.clone();
        let pool = self.surfaces.get_mut(item.kind);
        let signal = SurfaceSignal::new(item.kind, pool.active_slot().other(), token, events);
        tracing::debug!("Prefetching {} on standby", item.id);
        pool.load_standby(&item.id, &uri, signal);
    }

    fn on_prepare_failed(&mut self, error: PrepareError) {
        self.prepare_timer.cancel();
        self.consecutive_errors += 1;
        let total = self.playlist.as_ref().map_or(0, Playlist::len);
        let id = self.current_item().map(|item| item.id.clone()).unwrap_or_default();
        tracing::warn!(
            "Failed to play {} ({}/{} consecutive): {}",
            id,
            self.consecutive_errors,
            total,
            error
        );

        if self.consecutive_errors >= total {
            self.halt();
            return;
        }

        self.advance_timer.arm(
            self.config.error_backoff(),
            &self.events,
            TimerEvent {
                generation: self.generation,
                purpose: TimerPurpose::Advance,
            },
        );
    }

    fn halt(&mut self) {
        tracing::error!("Every item in the playlist failed, stopping playback");
        self.phase = Phase::AllContentFailed;
        self.advance_timer.cancel();
        self.deadline_timer.cancel();
        self.prepare_timer.cancel();
        self.transition = TransitionState::Idle;
        for pool in self.surfaces.iter_mut() {
            pool.clear_all();
        }
        self.status.show_error("None of the playlist content could be played");
    }

    /// Leave the halted state and play the current item again.
    fn recover(&mut self, why: &str) {
        tracing::info!("Retrying playback: {}", why);
        self.consecutive_errors = 0;
        self.select_and_play(self.cursor.index);
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event.purpose {
            TimerPurpose::Advance => {
                if event.generation != self.generation {
                    tracing::debug!("Ignoring stale timer (generation {})", event.generation);
                    return;
                }
                if self.phase == Phase::AllContentFailed {
                    return;
                }
                self.advance(Direction::Next);
            }
            TimerPurpose::TransitionDeadline => {
                if let TransitionState::Pending { deadline } = self.transition {
                    if Instant::now() >= deadline {
                        tracing::warn!("Transition did not finish in time, releasing guard");
                        self.transition = TransitionState::Idle;
                    }
                }
            }
            TimerPurpose::PrepareDeadline => {
                if event.generation != self.generation {
                    return;
                }
                let Phase::Preparing(kind) = self.phase else {
                    return;
                };
                let id = self.current_item().map(|item| item.id.clone()).unwrap_or_default();
                // Stop the stuck load; a late signal carries a token the pool no longer knows.
                self.surfaces.get_mut(kind).clear_all();
                self.on_prepare_failed(PrepareError::TimedOut {
                    id,
                    seconds: self.config.prepare_timeout_secs,
                });
            }
        }
    }

    fn on_input(&mut self, input: InputEvent) {
        match input {
            InputEvent::Next | InputEvent::Previous => {
                let direction = if input == InputEvent::Next {
                    Direction::Next
                } else {
                    Direction::Previous
                };
                if self.phase == Phase::AllContentFailed {
                    tracing::info!("Manual navigation, clearing failed state");
                    self.consecutive_errors = 0;
                }
                self.advance(direction);
            }
            InputEvent::Select => {
                if self.phase == Phase::Playing(ContentKind::Video) {
                    self.user_paused = !self.user_paused;
                    tracing::info!("{}", if self.user_paused { "Paused" } else { "Resumed" });
                    let paused = self.user_paused || !self.foreground;
                    self.surfaces.get_mut(ContentKind::Video).set_paused(paused);
                }
                self.show_overlay();
            }
            InputEvent::Info => self.show_overlay(),
        }
    }

    fn show_overlay(&mut self) {
        let Some(playlist) = &self.playlist else {
            return;
        };
        let Some(item) = playlist.get(self.cursor.index) else {
            return;
        };
        let overlay = StatusOverlay {
            title: item.title.clone(),
            position: self.cursor.index + 1,
            total: playlist.len(),
            kind: item.kind,
            display_seconds: item.display_seconds.map(|seconds| seconds.get()),
            availability: AvailabilityLabel::for_item(
                item,
                self.availability.download_progress(&item.id),
                self.online,
            ),
            paused: self.user_paused,
        };
        self.status.show_overlay(&overlay);
    }

    fn on_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.foreground = lifecycle == Lifecycle::Foreground;
        tracing::debug!("Lifecycle: {:?}", lifecycle);
        if self.phase == Phase::Playing(ContentKind::Video) {
            let paused = self.user_paused || !self.foreground;
            self.surfaces.get_mut(ContentKind::Video).set_paused(paused);
        }
    }

    fn on_manifest(&mut self, event: ManifestEvent) {
        match event {
            ManifestEvent::Loaded { playlist, origin } => self.on_playlist(playlist, origin),
            ManifestEvent::Unavailable { reason } => {
                if self.playlist.is_none() {
                    self.status.show_error(&reason);
                } else {
                    tracing::warn!("{}, keeping current playlist", reason);
                }
            }
            ManifestEvent::Connectivity { online } => {
                let restored = online && !self.online;
                self.online = online;
                self.update_offline_indicator();
                if restored && self.phase == Phase::AllContentFailed {
                    self.recover("connectivity restored");
                }
            }
        }
    }

    fn on_playlist(&mut self, mut playlist: Playlist, origin: ManifestOrigin) {
        for item in playlist.iter_mut() {
            item.refresh_offline(self.availability.as_ref());
        }
        if origin == ManifestOrigin::Remote {
            for item in playlist.items().iter().filter(|item| !item.offline.available) {
                self.availability.request_background_fetch(item);
            }
        }

        let index = match self.current_item() {
            None => 0,
            Some(current) => playlist.position_of(&current.id).unwrap_or(0),
        };
        let first = self.playlist.is_none();
        tracing::info!(
            "Playlist {} ({} items, {:?}), starting at {}",
            if first { "loaded" } else { "replaced" },
            playlist.len(),
            origin,
            index + 1
        );

        self.playlist = Some(playlist);
        self.origin = origin;
        if first {
            self.cursor = PlaybackCursor::default();
        }
        self.update_offline_indicator();

        self.consecutive_errors = 0;
        self.advance_timer.cancel();
        self.deadline_timer.cancel();
        self.transition = TransitionState::Idle;
        self.status.hide_loading();
        self.select_and_play(index);
    }

    fn update_offline_indicator(&mut self) {
        let offline = self.origin == ManifestOrigin::Cached || !self.online;
        self.status.set_offline_indicator(offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ContentItem;
    use crate::surface::{Surface, SurfacePool};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Ready,
        Fail,
        Manual,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Prepare(usize, String),
        Show(usize),
        Hide(usize),
        Clear(usize),
        Paused(usize, bool),
    }

    /// Shared by both surfaces of a pool.
    #[derive(Clone)]
    struct Recorder {
        mode: Arc<Mutex<Mode>>,
        calls: Arc<Mutex<Vec<Call>>>,
        signals: Arc<Mutex<Vec<SurfaceSignal>>>,
    }

    impl Recorder {
        fn new(mode: Mode) -> Self {
            Self {
                mode: Arc::new(Mutex::new(mode)),
                calls: Arc::new(Mutex::new(Vec::new())),
                signals: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn prepared(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|call| match call {
                    Call::Prepare(_, uri) => Some(uri.clone()),
                    _ => None,
                })
                .collect()
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn last_signal(&self) -> SurfaceSignal {
            self.signals.lock().unwrap().last().cloned().unwrap()
        }
    }

    struct FakeSurface {
        index: usize,
        recorder: Recorder,
    }

    impl Surface for FakeSurface {
        fn prepare(&mut self, uri: &Url, signal: SurfaceSignal) {
            self.recorder
                .calls
                .lock()
                .unwrap()
                .push(Call::Prepare(self.index, uri.to_string()));
            self.recorder.signals.lock().unwrap().push(signal.clone());
            match *self.recorder.mode.lock().unwrap() {
                Mode::Ready => signal.ready(),
                Mode::Fail => signal.failed("boom"),
                Mode::Manual => {}
            }
        }

        fn show(&mut self) {
            self.recorder.calls.lock().unwrap().push(Call::Show(self.index));
        }

        fn hide(&mut self) {
            self.recorder.calls.lock().unwrap().push(Call::Hide(self.index));
        }

        fn clear(&mut self) {
            self.recorder.calls.lock().unwrap().push(Call::Clear(self.index));
        }

        fn set_paused(&mut self, paused: bool) {
            self.recorder
                .calls
                .lock()
                .unwrap()
                .push(Call::Paused(self.index, paused));
        }
    }

    #[derive(Default)]
    struct FakeAvailability {
        local: Mutex<HashMap<String, Option<Url>>>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeAvailability {
        fn add(&self, id: &str, uri: Option<&str>) {
            self.local
                .lock()
                .unwrap()
                .insert(id.to_string(), uri.map(|u| Url::parse(u).unwrap()));
        }
    }

    impl ContentAvailability for FakeAvailability {
        fn is_available(&self, id: &str) -> bool {
            self.local.lock().unwrap().contains_key(id)
        }

        fn local_uri(&self, id: &str, _kind: ContentKind) -> Option<Url> {
            self.local.lock().unwrap().get(id).cloned().flatten()
        }

        fn request_background_fetch(&self, item: &ContentItem) {
            self.requested.lock().unwrap().push(item.id.clone());
        }
    }

    #[derive(Default)]
    struct StatusLog {
        loading: Vec<String>,
        errors: Vec<String>,
        overlays: Vec<StatusOverlay>,
        offline: Option<bool>,
    }

    #[derive(Clone, Default)]
    struct FakeStatus(Arc<Mutex<StatusLog>>);

    impl StatusDisplay for FakeStatus {
        fn show_loading(&mut self, message: &str) {
            self.0.lock().unwrap().loading.push(message.to_string());
        }
        fn hide_loading(&mut self) {}
        fn show_error(&mut self, message: &str) {
            self.0.lock().unwrap().errors.push(message.to_string());
        }
        fn show_overlay(&mut self, overlay: &StatusOverlay) {
            self.0.lock().unwrap().overlays.push(overlay.clone());
        }
        fn set_offline_indicator(&mut self, offline: bool) {
            self.0.lock().unwrap().offline = Some(offline);
        }
    }

    struct Harness {
        orch: Orchestrator,
        rx: mpsc::UnboundedReceiver<PlayerEvent>,
        video: Recorder,
        document: Recorder,
        image: Recorder,
        status: FakeStatus,
        availability: Arc<FakeAvailability>,
    }

    fn pool(kind: ContentKind, recorder: &Recorder) -> SurfacePool {
        SurfacePool::new(
            kind,
            Box::new(FakeSurface {
                index: 0,
                recorder: recorder.clone(),
            }),
            Box::new(FakeSurface {
                index: 1,
                recorder: recorder.clone(),
            }),
        )
    }

    impl Harness {
        fn new(mode: Mode) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let video = Recorder::new(mode);
            let document = Recorder::new(mode);
            let image = Recorder::new(mode);
            let surfaces = SurfaceSet::new(
                pool(ContentKind::Video, &video),
                pool(ContentKind::Document, &document),
                pool(ContentKind::Image, &image),
            );
            let status = FakeStatus::default();
            let availability = Arc::new(FakeAvailability::default());
            let mut orch = Orchestrator::new(
                PlaybackConfig::default(),
                surfaces,
                availability.clone(),
                Box::new(status.clone()),
                tx,
            );
            orch.start();
            Self {
                orch,
                rx,
                video,
                document,
                image,
                status,
                availability,
            }
        }

        fn recorder(&self, kind: ContentKind) -> &Recorder {
            match kind {
                ContentKind::Video => &self.video,
                ContentKind::Document => &self.document,
                ContentKind::Image => &self.image,
            }
        }

        /// Handle everything already queued.
        fn settle(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.orch.handle(event);
            }
        }

        /// Run the event loop for `duration` of (paused) time.
        async fn run_for(&mut self, duration: Duration) {
            self.settle();
            let until = Instant::now() + duration;
            loop {
                tokio::select! {
                    biased;
                    Some(event) = self.rx.recv() => self.orch.handle(event),
                    _ = tokio::time::sleep_until(until) => break,
                }
            }
        }

        fn load(&mut self, items: Vec<ContentItem>, origin: ManifestOrigin) {
            let playlist = Playlist::new(items).unwrap();
            self.orch.handle(PlayerEvent::Manifest(ManifestEvent::Loaded { playlist, origin }));
            self.settle();
        }

        fn index(&self) -> usize {
            self.orch.cursor().index
        }

        fn current_id(&self) -> String {
            self.orch.current_item().unwrap().id.clone()
        }
    }

    fn item(id: &str, kind: ContentKind) -> ContentItem {
        ContentItem::new(id, format!("https://cdn.example.com/{}", id), kind)
    }

    fn images(ids: &[&str]) -> Vec<ContentItem> {
        ids.iter().map(|id| item(id, ContentKind::Image)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn next_is_circular() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);
        assert_eq!(h.index(), 0);
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));

        for _ in 0..3 {
            assert!(h.orch.advance(Direction::Next));
            h.settle();
        }
        assert_eq!(h.index(), 0);

        assert!(h.orch.advance(Direction::Previous));
        h.settle();
        assert_eq!(h.index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn select_and_play_wraps_out_of_range_index() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);
        h.orch.select_and_play(7);
        h.settle();
        assert_eq!(h.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn advance_is_dropped_while_transitioning_until_deadline() {
        let mut h = Harness::new(Mode::Manual);
        h.load(images(&["a", "b"]), ManifestOrigin::Remote);

        h.orch.begin_transition();
        assert!(h.orch.is_transitioning());
        assert!(!h.orch.advance(Direction::Next));
        assert_eq!(h.index(), 0);

        h.run_for(Duration::from_secs(9)).await;
        assert!(h.orch.is_transitioning());
        h.run_for(Duration::from_secs(2)).await;
        assert!(!h.orch.is_transitioning());

        assert!(h.orch.advance(Direction::Next));
        assert_eq!(h.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_is_released_once_dispatched() {
        let mut h = Harness::new(Mode::Manual);
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);

        assert!(h.orch.advance(Direction::Next));
        assert!(!h.orch.is_transitioning());
        assert!(h.orch.advance(Direction::Next));
        assert_eq!(h.index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn display_time_from_manifest() {
        let mut h = Harness::new(Mode::Ready);
        h.video.set_mode(Mode::Manual);
        h.load(
            vec![
                item("menu", ContentKind::Document).with_display_seconds(7),
                item("clip", ContentKind::Video),
            ],
            ManifestOrigin::Remote,
        );
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Document));

        h.run_for(Duration::from_millis(6_900)).await;
        assert_eq!(h.current_id(), "menu");

        h.run_for(Duration::from_millis(200)).await;
        assert_eq!(h.current_id(), "clip");
        assert_eq!(h.video.prepared().len(), 1);

        h.run_for(Duration::from_secs(20)).await;
        assert_eq!(h.current_id(), "clip");
        assert_eq!(h.video.prepared().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_display_time_is_ten_seconds() {
        let mut h = Harness::new(Mode::Ready);
        h.video.set_mode(Mode::Manual);
        h.load(
            vec![item("poster", ContentKind::Image), item("clip", ContentKind::Video)],
            ManifestOrigin::Remote,
        );

        h.run_for(Duration::from_millis(9_900)).await;
        assert_eq!(h.current_id(), "poster");
        h.run_for(Duration::from_millis(200)).await;
        assert_eq!(h.current_id(), "clip");
    }

    #[tokio::test(start_paused = true)]
    async fn full_lap_of_failures_halts() {
        let mut h = Harness::new(Mode::Fail);
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);
        assert_eq!(h.orch.consecutive_errors(), 1);

        h.run_for(Duration::from_secs(10)).await;
        assert_eq!(h.orch.phase(), Phase::AllContentFailed);
        assert_eq!(h.orch.consecutive_errors(), 3);
        assert_eq!(h.image.prepared().len(), 3);
        assert_eq!(h.status.0.lock().unwrap().errors.len(), 1);

        // Not retried on its own.
        h.run_for(Duration::from_secs(60)).await;
        assert_eq!(h.image.prepared().len(), 3);

        h.image.set_mode(Mode::Ready);
        h.orch.handle(PlayerEvent::Input(InputEvent::Next));
        h.settle();
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));
        assert_eq!(h.orch.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_error_count() {
        let mut h = Harness::new(Mode::Ready);
        h.image.set_mode(Mode::Fail);
        h.load(
            vec![
                item("broken", ContentKind::Image),
                item("page", ContentKind::Document),
                item("broken-too", ContentKind::Image),
            ],
            ManifestOrigin::Remote,
        );
        assert_eq!(h.orch.consecutive_errors(), 1);

        h.run_for(Duration::from_millis(1_100)).await;
        assert_eq!(h.current_id(), "page");
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Document));
        assert_eq!(h.orch.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_video_loops_with_fresh_prepare() {
        let mut h = Harness::new(Mode::Manual);
        h.load(
            vec![ContentItem::new("1", "https://cdn.example.com/v1.mp4", ContentKind::Video)],
            ManifestOrigin::Remote,
        );
        assert_eq!(h.video.prepared().len(), 1);

        h.video.last_signal().ready();
        h.settle();
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Video));

        h.video.last_signal().ended();
        h.settle();
        assert_eq!(h.index(), 0);
        assert_eq!(h.orch.phase(), Phase::Preparing(ContentKind::Video));
        assert_eq!(
            h.video.prepared(),
            vec!["https://cdn.example.com/v1.mp4", "https://cdn.example.com/v1.mp4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_that_never_reports_is_skipped() {
        let mut h = Harness::new(Mode::Manual);
        h.load(images(&["a", "b"]), ManifestOrigin::Remote);

        h.run_for(Duration::from_secs(29)).await;
        assert_eq!(h.index(), 0);
        assert_eq!(h.orch.phase(), Phase::Preparing(ContentKind::Image));
        assert_eq!(h.orch.consecutive_errors(), 0);

        h.run_for(Duration::from_millis(1_500)).await;
        assert_eq!(h.orch.consecutive_errors(), 1);
        assert!(h.image.calls().contains(&Call::Clear(0)));

        h.run_for(Duration::from_secs(1)).await;
        assert_eq!(h.current_id(), "b");
        assert_eq!(
            h.image.prepared(),
            vec!["https://cdn.example.com/a", "https://cdn.example.com/b"]
        );

        // A late answer for the abandoned item changes nothing.
        h.image.signals.lock().unwrap()[0].ready();
        h.settle();
        assert_eq!(h.orch.phase(), Phase::Preparing(ContentKind::Image));

        h.run_for(Duration::from_secs(30)).await;
        assert_eq!(h.orch.phase(), Phase::AllContentFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_in_time_cancels_prepare_deadline() {
        let mut h = Harness::new(Mode::Manual);
        h.load(
            vec![item("clip", ContentKind::Video), item("other", ContentKind::Video)],
            ManifestOrigin::Remote,
        );
        h.run_for(Duration::from_secs(20)).await;
        h.video.last_signal().ready();
        h.run_for(Duration::from_secs(60)).await;
        assert_eq!(h.current_id(), "clip");
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Video));
        assert_eq!(h.orch.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn relative_single_video_manifest_loops() {
        let mut h = Harness::new(Mode::Manual);
        let base = Url::parse("https://signage.example.com/playlist.json").unwrap();
        let playlist =
            crate::manifest::parse_relative_to(br#"[{"id":"1","url":"v1.mp4","type":"video"}]"#, &base)
                .unwrap();
        h.orch.handle(PlayerEvent::Manifest(ManifestEvent::Loaded {
            playlist,
            origin: ManifestOrigin::Remote,
        }));
        h.settle();
        assert_eq!(h.video.prepared(), vec!["https://signage.example.com/v1.mp4"]);

        for _ in 0..2 {
            h.video.last_signal().ready();
            h.settle();
            assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Video));
            h.video.last_signal().ended();
            h.settle();
        }
        assert_eq!(h.index(), 0);
        assert_eq!(h.orch.consecutive_errors(), 0);
        assert_eq!(h.video.prepared().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_restarts_when_current_item_is_gone() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b", "c", "d", "e"]), ManifestOrigin::Remote);
        h.orch.select_and_play(2);
        h.settle();
        assert_eq!(h.index(), 2);

        h.load(images(&["x", "y", "z"]), ManifestOrigin::Remote);
        assert_eq!(h.index(), 0);
        assert_eq!(h.current_id(), "x");
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_follows_current_item_by_id() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b", "c", "d", "e"]), ManifestOrigin::Remote);
        h.orch.select_and_play(3);
        h.settle();

        h.load(images(&["a", "d", "e"]), ManifestOrigin::Remote);
        assert_eq!(h.index(), 1);
        assert_eq!(h.current_id(), "d");
    }

    #[tokio::test(start_paused = true)]
    async fn only_document_failing_halts_after_one_error() {
        let mut h = Harness::new(Mode::Fail);
        h.load(vec![item("page", ContentKind::Document)], ManifestOrigin::Remote);

        assert_eq!(h.orch.phase(), Phase::AllContentFailed);
        assert_eq!(h.orch.consecutive_errors(), 1);
        h.run_for(Duration::from_secs(30)).await;
        assert_eq!(h.document.prepared().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prefetched_standby_is_swapped_in() {
        let mut h = Harness::new(Mode::Manual);
        h.load(images(&["a", "b"]), ManifestOrigin::Remote);
        assert_eq!(h.image.prepared(), vec!["https://cdn.example.com/a"]);

        h.image.last_signal().ready();
        h.settle();
        assert_eq!(
            h.image.calls().last(),
            Some(&Call::Prepare(1, "https://cdn.example.com/b".into()))
        );

        h.image.last_signal().ready();
        h.settle();
        assert!(h.orch.advance(Direction::Next));
        h.settle();

        assert_eq!(h.current_id(), "b");
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));
        assert_eq!(h.orch.surfaces().image.active_slot(), crate::surface::Slot::Secondary);
        // b was not loaded again; only a was prefetched for the next lap.
        assert_eq!(
            h.image.prepared(),
            vec![
                "https://cdn.example.com/a",
                "https://cdn.example.com/b",
                "https://cdn.example.com/a"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn standby_failure_is_not_a_playback_error() {
        let mut h = Harness::new(Mode::Manual);
        h.load(images(&["a", "b"]), ManifestOrigin::Remote);
        h.image.last_signal().ready();
        h.settle();

        h.image.last_signal().failed("404");
        h.settle();
        assert_eq!(h.orch.consecutive_errors(), 0);
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_after_navigation_is_ignored() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);
        let old = h.orch.generation;

        h.orch.handle(PlayerEvent::Input(InputEvent::Next));
        h.settle();
        assert_eq!(h.index(), 1);

        h.orch.handle(PlayerEvent::Timer(TimerEvent {
            generation: old,
            purpose: TimerPurpose::Advance,
        }));
        assert_eq!(h.index(), 1);

        // b's own timer runs from the navigation, not from a's start.
        h.run_for(Duration::from_millis(9_900)).await;
        assert_eq!(h.index(), 1);
        h.run_for(Duration::from_millis(200)).await;
        assert_eq!(h.index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn source_resolution_by_kind() {
        let mut h = Harness::new(Mode::Manual);
        h.availability.add("clip", Some("file:///cache/content/clip.mp4"));
        h.availability.add("page", Some("file:///cache/content/page.html"));
        h.availability.add("broken", None);
        h.availability.add("local", Some("file:///cache/content/local.jpg"));
        h.load(
            vec![
                item("clip", ContentKind::Video),
                item("page", ContentKind::Document),
                item("broken", ContentKind::Video),
                ContentItem::new("local", "", ContentKind::Image),
                ContentItem::new("nothing", "", ContentKind::Image),
            ],
            ManifestOrigin::Remote,
        );
        assert_eq!(h.video.prepared(), vec!["file:///cache/content/clip.mp4"]);

        h.orch.select_and_play(1);
        assert_eq!(h.document.prepared(), vec!["https://cdn.example.com/page"]);

        h.orch.select_and_play(2);
        assert_eq!(h.video.prepared().last().unwrap(), "https://cdn.example.com/broken");

        h.orch.select_and_play(3);
        assert_eq!(h.image.prepared(), vec!["file:///cache/content/local.jpg"]);

        h.orch.select_and_play(4);
        assert_eq!(h.image.prepared().len(), 1);
        assert_eq!(h.orch.consecutive_errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_playlist_prefers_local_documents() {
        let mut h = Harness::new(Mode::Manual);
        h.availability.add("page", Some("file:///cache/content/page.html"));
        h.load(vec![item("page", ContentKind::Document)], ManifestOrigin::Cached);

        assert_eq!(h.document.prepared(), vec!["file:///cache/content/page.html"]);
        assert_eq!(h.status.0.lock().unwrap().offline, Some(true));
        assert!(h.availability.requested.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_load_requests_missing_downloads() {
        let mut h = Harness::new(Mode::Manual);
        h.availability.add("b", Some("file:///cache/content/b.jpg"));
        h.load(images(&["a", "b", "c"]), ManifestOrigin::Remote);

        let requested: HashSet<String> = h.availability.requested.lock().unwrap().iter().cloned().collect();
        assert_eq!(requested, HashSet::from(["a".to_string(), "c".to_string()]));
        assert_eq!(h.status.0.lock().unwrap().offline, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn select_toggles_video_pause() {
        let mut h = Harness::new(Mode::Ready);
        h.load(vec![item("clip", ContentKind::Video)], ManifestOrigin::Remote);

        h.orch.handle(PlayerEvent::Input(InputEvent::Select));
        assert!(h.video.calls().contains(&Call::Paused(0, true)));
        h.orch.handle(PlayerEvent::Input(InputEvent::Select));
        assert!(h.video.calls().contains(&Call::Paused(0, false)));

        let status = h.status.0.lock().unwrap();
        assert_eq!(status.overlays.len(), 2);
        assert!(status.overlays[0].paused);
        assert_eq!(status.overlays[0].position, 1);
        assert_eq!(status.overlays[0].availability, AvailabilityLabel::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn select_on_image_only_shows_overlay() {
        let mut h = Harness::new(Mode::Ready);
        h.load(images(&["a", "b"]), ManifestOrigin::Remote);

        h.orch.handle(PlayerEvent::Input(InputEvent::Select));
        assert!(!h
            .image
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Paused(..))));
        let status = h.status.0.lock().unwrap();
        assert_eq!(status.overlays.len(), 1);
        assert_eq!(status.overlays[0].total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_pauses_video() {
        let mut h = Harness::new(Mode::Ready);
        h.load(vec![item("clip", ContentKind::Video)], ManifestOrigin::Remote);

        h.orch.handle(PlayerEvent::Lifecycle(Lifecycle::Background));
        assert_eq!(h.video.calls().last(), Some(&Call::Paused(0, true)));
        h.orch.handle(PlayerEvent::Lifecycle(Lifecycle::Foreground));
        assert_eq!(h.video.calls().last(), Some(&Call::Paused(0, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_return_recovers_halted_playback() {
        let mut h = Harness::new(Mode::Fail);
        h.load(vec![item("page", ContentKind::Document)], ManifestOrigin::Remote);
        assert_eq!(h.orch.phase(), Phase::AllContentFailed);

        h.orch
            .handle(PlayerEvent::Manifest(ManifestEvent::Connectivity { online: false }));
        assert_eq!(h.status.0.lock().unwrap().offline, Some(true));

        h.document.set_mode(Mode::Ready);
        h.orch
            .handle(PlayerEvent::Manifest(ManifestEvent::Connectivity { online: true }));
        h.settle();
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Document));
        assert_eq!(h.status.0.lock().unwrap().offline, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_manifest_is_shown_before_first_load() {
        let mut h = Harness::new(Mode::Ready);
        assert_eq!(h.status.0.lock().unwrap().loading, vec!["Loading playlist"]);

        h.orch.handle(PlayerEvent::Manifest(ManifestEvent::Unavailable {
            reason: "No offline content available".into(),
        }));
        assert_eq!(h.orch.phase(), Phase::Loading);
        assert_eq!(
            h.status.0.lock().unwrap().errors,
            vec!["No offline content available"]
        );

        h.load(images(&["a"]), ManifestOrigin::Remote);
        h.orch.handle(PlayerEvent::Manifest(ManifestEvent::Unavailable {
            reason: "gone".into(),
        }));
        assert_eq!(h.status.0.lock().unwrap().errors.len(), 1);
        assert_eq!(h.orch.phase(), Phase::Playing(ContentKind::Image));
    }

    #[tokio::test(start_paused = true)]
    async fn kind_change_hides_previous_surfaces() {
        let mut h = Harness::new(Mode::Ready);
        h.load(
            vec![item("clip", ContentKind::Video), item("poster", ContentKind::Image)],
            ManifestOrigin::Remote,
        );
        assert!(h.video.calls().contains(&Call::Show(0)));

        h.orch.advance(Direction::Next);
        h.settle();
        let video_calls = h.video.calls();
        assert!(video_calls.contains(&Call::Clear(0)));
        assert!(video_calls.contains(&Call::Clear(1)));
        assert!(matches!(video_calls.last(), Some(Call::Hide(_))));

        assert_eq!(h.orch.cursor().previous_kind, Some(ContentKind::Video));
        assert_eq!(h.orch.cursor().current_kind, Some(ContentKind::Image));
        // The prefetched poster was swapped in on the second surface.
        assert!(h.recorder(ContentKind::Image).calls().ends_with(&[Call::Show(1), Call::Hide(0)]));
    }
}
