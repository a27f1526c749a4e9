//! One-shot timers that post into the player event queue.

use crate::events::{PlayerEvent, TimerEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Holds at most one pending timer. Arming replaces (and aborts) the
/// previous one. Receivers still compare the generation carried by the
/// event, since an abort cannot recall an event already queued.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn arm(
        &mut self,
        delay: Duration,
        events: &mpsc::UnboundedSender<PlayerEvent>,
        event: TimerEvent,
    ) {
        self.cancel();
        let events = events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PlayerEvent::Timer(event));
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
