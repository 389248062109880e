//! Single-slot, newest-wins handoff between the harvester and the
//! presenter.
//!
//! The slot holds at most one surface. Publishing over a surface that was
//! never taken drops the older one and counts it as skipped; the presenter
//! therefore always shows the most recent picture and is never more than
//! one picture behind.

use parking_lot::{Condvar, Mutex};

use rk_common::SurfaceId;

/// What the presenter receives from [`Mailbox::take_or_wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The newest surface, with the number of surfaces dropped since the
    /// previous take.
    Surface { surface: SurfaceId, skipped: u32 },
    /// End of stream and nothing left to show.
    EndOfStream,
}

/// Lifetime counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub published: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Slot {
    pending: Option<SurfaceId>,
    skipped: u32,
    eos: bool,
    stats: MailboxStats,
}

#[derive(Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `surface` as the pending one and wake the presenter.
    ///
    /// Returns the skip count after the publish (0 when the slot was empty).
    pub fn publish(&self, surface: SurfaceId) -> u32 {
        let mut slot = self.slot.lock();
        if slot.pending.replace(surface).is_some() {
            slot.skipped += 1;
            slot.stats.skipped += 1;
        }
        slot.stats.published += 1;
        let skipped = slot.skipped;
        drop(slot);
        self.ready.notify_one();
        skipped
    }

    /// Block until a surface is pending or the stream has ended.
    ///
    /// A pending surface is always delivered before `EndOfStream`, so the
    /// last picture of the stream is shown.
    pub fn take_or_wait(&self) -> Delivery {
        let mut slot = self.slot.lock();
        loop {
            if let Some(surface) = slot.pending.take() {
                let skipped = std::mem::take(&mut slot.skipped);
                return Delivery::Surface { surface, skipped };
            }
            if slot.eos {
                return Delivery::EndOfStream;
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Mark the end of the stream and wake every waiter.
    pub fn signal_eos(&self) {
        self.slot.lock().eos = true;
        self.ready.notify_all();
    }

    pub fn is_eos(&self) -> bool {
        self.slot.lock().eos
    }

    pub fn stats(&self) -> MailboxStats {
        self.slot.lock().stats
    }
}
