//! Rendering surface contract and the dual-surface pool.
//!
//! Each content kind owns two interchangeable surfaces. One is active (the
//! one that is or will be shown), the other is standby and may be prepared
//! ahead of time so the next switch is instant.

use crate::events::{PlayerEvent, SurfaceEvent, SurfaceOutcome};
use crate::manifest::ContentKind;
use std::fmt;
use tokio::sync::mpsc;
use url::Url;

/// A renderer for one content kind.
///
/// `prepare` must eventually report exactly one of `ready` or `failed`
/// through the given signal, from any thread. Video surfaces additionally
/// report `ended` at the natural end of the stream. Surfaces must not make
/// themselves visible; the orchestrator calls `show` once content is ready.
pub trait Surface: Send {
    fn prepare(&mut self, uri: &Url, signal: SurfaceSignal);
    fn show(&mut self);
    fn hide(&mut self);
    /// Drop loaded content and stop any playback.
    fn clear(&mut self);
    fn set_paused(&mut self, _paused: bool) {}
}

/// Which of the two surfaces in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Primary,
    Secondary,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => 1,
        }
    }
}

/// Handle a surface uses to report back. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct SurfaceSignal {
    kind: ContentKind,
    slot: Slot,
    token: u64,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl SurfaceSignal {
    pub(crate) fn new(
        kind: ContentKind,
        slot: Slot,
        token: u64,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Self {
        Self {
            kind,
            slot,
            token,
            events,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn ready(&self) {
        self.post(SurfaceOutcome::Ready);
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.post(SurfaceOutcome::Failed(reason.into()));
    }

    pub fn ended(&self) {
        self.post(SurfaceOutcome::Ended);
    }

    fn post(&self, signal: SurfaceOutcome) {
        let event = SurfaceEvent {
            kind: self.kind,
            slot: self.slot,
            token: self.token,
            signal,
        };
        if self.events.send(PlayerEvent::Surface(event)).is_err() {
            tracing::debug!("Player stopped, dropping {} surface signal", self.kind);
        }
    }
}

impl fmt::Debug for SurfaceSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceSignal")
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .field("token", &self.token)
            .finish()
    }
}

/// What the standby surface holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyState {
    Empty,
    Preparing { item_id: String, token: u64 },
    Ready { item_id: String, token: u64 },
}

/// What the active surface holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveState {
    Idle,
    Preparing { item_id: String, token: u64 },
    Presenting { item_id: String, token: u64 },
}

/// How a surface signal changed the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolUpdate {
    ActiveReady,
    ActiveFailed(String),
    ActiveEnded,
    StandbyReady,
    StandbyFailed(String),
    /// Signal for content that is no longer wanted.
    Stale,
}

/// Two surfaces of one kind plus their bookkeeping.
pub struct SurfacePool {
    kind: ContentKind,
    surfaces: [Box<dyn Surface>; 2],
    active: Slot,
    active_state: ActiveState,
    standby: StandbyState,
}

impl SurfacePool {
    pub fn new(kind: ContentKind, primary: Box<dyn Surface>, secondary: Box<dyn Surface>) -> Self {
        Self {
            kind,
            surfaces: [primary, secondary],
            active: Slot::Primary,
            active_state: ActiveState::Idle,
            standby: StandbyState::Empty,
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn active_slot(&self) -> Slot {
        self.active
    }

    pub fn active_state(&self) -> &ActiveState {
        &self.active_state
    }

    pub fn standby_state(&self) -> &StandbyState {
        &self.standby
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self.active_state, ActiveState::Presenting { .. })
    }

    fn surface(&mut self, slot: Slot) -> &mut dyn Surface {
        self.surfaces[slot.index()].as_mut()
    }

    /// Load an item onto the active surface.
    pub(crate) fn load_active(&mut self, item_id: &str, uri: &Url, signal: SurfaceSignal) {
        self.active_state = ActiveState::Preparing {
            item_id: item_id.to_string(),
            token: signal.token(),
        };
        let slot = self.active;
        self.surface(slot).prepare(uri, signal);
    }

    /// Load an item onto the hidden standby surface.
    pub(crate) fn load_standby(&mut self, item_id: &str, uri: &Url, signal: SurfaceSignal) {
        self.standby = StandbyState::Preparing {
            item_id: item_id.to_string(),
            token: signal.token(),
        };
        let slot = self.active.other();
        let surface = self.surface(slot);
        surface.hide();
        surface.prepare(uri, signal);
    }

    /// Make the twin surface active for a fresh load. The outgoing surface
    /// stays on screen until the new content is presented.
    pub(crate) fn rotate(&mut self) {
        self.active = self.active.other();
        self.active_state = ActiveState::Idle;
        self.standby = StandbyState::Empty;
    }

    /// Swap in the standby surface if it already holds `item_id`.
    pub(crate) fn promote_standby(&mut self, item_id: &str) -> bool {
        let token = match &self.standby {
            StandbyState::Ready { item_id: ready, token } if ready == item_id => *token,
            _ => return false,
        };
        self.active = self.active.other();
        self.active_state = ActiveState::Presenting {
            item_id: item_id.to_string(),
            token,
        };
        self.standby = StandbyState::Empty;
        self.present_active();
        true
    }

    pub(crate) fn discard_standby(&mut self) {
        self.standby = StandbyState::Empty;
    }

    /// Show the active surface and hide its twin.
    pub(crate) fn present_active(&mut self) {
        let active = self.active;
        self.surface(active).show();
        self.surface(active.other()).hide();
    }

    pub(crate) fn hide_all(&mut self) {
        for surface in self.surfaces.iter_mut() {
            surface.hide();
        }
    }

    /// Hide and unload both surfaces and forget any pending work.
    pub(crate) fn clear_all(&mut self) {
        for surface in self.surfaces.iter_mut() {
            surface.hide();
            surface.clear();
        }
        self.active_state = ActiveState::Idle;
        self.standby = StandbyState::Empty;
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        let active = self.active;
        self.surface(active).set_paused(paused);
    }

    /// Apply a surface signal to the pool's bookkeeping.
    pub(crate) fn apply(&mut self, slot: Slot, token: u64, signal: SurfaceOutcome) -> PoolUpdate {
        let on_active = slot == self.active;
        match signal {
            SurfaceOutcome::Ready => {
                if on_active {
                    if let ActiveState::Preparing { item_id, token: t } = &self.active_state {
                        if *t == token {
                            self.active_state = ActiveState::Presenting {
                                item_id: item_id.clone(),
                                token,
                            };
                            return PoolUpdate::ActiveReady;
                        }
                    }
                } else if let StandbyState::Preparing { item_id, token: t } = &self.standby {
                    if *t == token {
                        self.standby = StandbyState::Ready {
                            item_id: item_id.clone(),
                            token,
                        };
                        return PoolUpdate::StandbyReady;
                    }
                }
                PoolUpdate::Stale
            }
            SurfaceOutcome::Failed(reason) => {
                if on_active {
                    match &self.active_state {
                        ActiveState::Preparing { token: t, .. }
                        | ActiveState::Presenting { token: t, .. }
                            if *t == token =>
                        {
                            self.active_state = ActiveState::Idle;
                            return PoolUpdate::ActiveFailed(reason);
                        }
                        _ => {}
                    }
                } else {
                    match &self.standby {
                        StandbyState::Preparing { token: t, .. }
                        | StandbyState::Ready { token: t, .. }
                            if *t == token =>
                        {
                            self.standby = StandbyState::Empty;
                            return PoolUpdate::StandbyFailed(reason);
                        }
                        _ => {}
                    }
                }
                PoolUpdate::Stale
            }
            SurfaceOutcome::Ended => match &self.active_state {
                ActiveState::Presenting { token: t, .. } if on_active && *t == token => {
                    PoolUpdate::ActiveEnded
                }
                _ => PoolUpdate::Stale,
            },
        }
    }
}

/// One pool per content kind.
pub struct SurfaceSet {
    pub video: SurfacePool,
    pub document: SurfacePool,
    pub image: SurfacePool,
}

impl SurfaceSet {
    pub fn new(video: SurfacePool, document: SurfacePool, image: SurfacePool) -> Self {
        Self {
            video,
            document,
            image,
        }
    }

    pub fn get(&self, kind: ContentKind) -> &SurfacePool {
        match kind {
            ContentKind::Video => &self.video,
            ContentKind::Document => &self.document,
            ContentKind::Image => &self.image,
        }
    }

    pub fn get_mut(&mut self, kind: ContentKind) -> &mut SurfacePool {
        match kind {
            ContentKind::Video => &mut self.video,
            ContentKind::Document => &mut self.document,
            ContentKind::Image => &mut self.image,
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SurfacePool> {
        [&mut self.video, &mut self.document, &mut self.image].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct NullSurface {
        shown: Arc<Mutex<bool>>,
    }

    impl Surface for NullSurface {
        fn prepare(&mut self, _uri: &Url, _signal: SurfaceSignal) {}
        fn show(&mut self) {
            *self.shown.lock().unwrap() = true;
        }
        fn hide(&mut self) {
            *self.shown.lock().unwrap() = false;
        }
        fn clear(&mut self) {}
    }

    fn pool() -> (SurfacePool, Arc<Mutex<bool>>, Arc<Mutex<bool>>) {
        let primary = NullSurface::default();
        let secondary = NullSurface::default();
        let shown = (primary.shown.clone(), secondary.shown.clone());
        let pool = SurfacePool::new(ContentKind::Image, Box::new(primary), Box::new(secondary));
        (pool, shown.0, shown.1)
    }

    fn signal(slot: Slot, token: u64) -> SurfaceSignal {
        let (tx, _rx) = mpsc::unbounded_channel();
        SurfaceSignal::new(ContentKind::Image, slot, token, tx)
    }

    #[test]
    fn standby_promotion_swaps_surfaces() {
        let (mut pool, primary_shown, secondary_shown) = pool();
        let uri = Url::parse("https://example.com/a.jpg").unwrap();

        pool.load_active("a", &uri, signal(Slot::Primary, 1));
        assert_eq!(pool.apply(Slot::Primary, 1, SurfaceOutcome::Ready), PoolUpdate::ActiveReady);
        pool.present_active();

        pool.load_standby("b", &uri, signal(Slot::Secondary, 2));
        assert!(!pool.promote_standby("b"));
        assert_eq!(pool.apply(Slot::Secondary, 2, SurfaceOutcome::Ready), PoolUpdate::StandbyReady);
        assert!(!pool.promote_standby("c"));
        assert!(pool.promote_standby("b"));

        assert_eq!(pool.active_slot(), Slot::Secondary);
        assert_eq!(pool.standby_state(), &StandbyState::Empty);
        assert!(*secondary_shown.lock().unwrap());
        assert!(!*primary_shown.lock().unwrap());
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let (mut pool, _, _) = pool();
        let uri = Url::parse("https://example.com/a.jpg").unwrap();

        pool.load_active("a", &uri, signal(Slot::Primary, 1));
        pool.load_active("b", &uri, signal(Slot::Primary, 2));

        assert_eq!(pool.apply(Slot::Primary, 1, SurfaceOutcome::Ready), PoolUpdate::Stale);
        assert_eq!(
            pool.apply(Slot::Primary, 2, SurfaceOutcome::Failed("404".into())),
            PoolUpdate::ActiveFailed("404".into())
        );
        assert_eq!(pool.active_state(), &ActiveState::Idle);
        assert_eq!(pool.apply(Slot::Primary, 2, SurfaceOutcome::Ended), PoolUpdate::Stale);
    }
}
