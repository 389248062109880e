//! Simulated decoder engine.
//!
//! `SimDecoder` speaks the same packet/event protocol as the MPP session
//! without any hardware: every non-empty packet becomes one picture, the
//! first picture is preceded by a resolution change, and the empty
//! end-of-stream packet drains to `EndOfStream`. Pictures land in the
//! committed external buffers in round-robin order.
//!
//! The engine enforces the handshake a real decoder expects (commit,
//! register, acknowledge) and counts every picture it hands out and gets
//! back, so tests can assert exactly-once release.

use std::collections::{HashSet, VecDeque};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info};

use rk_common::{
    BufferIdentity, DecodeError, DecodedPicture, DecoderEngine, ExportDescriptor, FrameEvent,
    FrameFormat, PixelFormat, SubmitStatus,
};

/// Offset added to exported descriptors to form buffer identities,
/// mimicking a decoder that keeps its own duplicate of every descriptor.
const DUPLICATE_OFFSET: i32 = 1000;

/// Behaviour knobs for [`SimDecoder`].
#[derive(Clone, Debug)]
pub struct SimDecoderConfig {
    /// Geometry announced by the resolution change.
    pub format: FrameFormat,
    /// Depth of the input queue; a full queue refuses submissions.
    pub queue_depth: usize,
    /// Report identities that differ from the exported descriptors.
    pub duplicate_descriptors: bool,
    /// Announce a second resolution change after this many pictures.
    pub second_resolution_after: Option<u64>,
    /// Fail `pull_event` after this many pictures.
    pub fail_after: Option<u64>,
    /// Report pictures in a buffer that was never committed.
    pub report_foreign_buffer: bool,
}

impl Default for SimDecoderConfig {
    fn default() -> Self {
        Self {
            format: FrameFormat {
                width: 1280,
                height: 720,
                hor_stride: 1280,
                ver_stride: 720,
                pixel_format: PixelFormat::Nv12,
            },
            queue_depth: 4,
            duplicate_descriptors: true,
            second_resolution_after: None,
            fail_after: None,
            report_foreign_buffer: false,
        }
    }
}

/// A picture produced by [`SimDecoder`].
#[derive(Debug, PartialEq, Eq)]
pub struct SimPicture {
    identity: BufferIdentity,
    sequence: u64,
}

impl SimPicture {
    pub fn new(identity: BufferIdentity) -> Self {
        Self {
            identity,
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl DecodedPicture for SimPicture {
    fn buffer_identity(&self) -> BufferIdentity {
        self.identity
    }
}

/// Counters exposed for assertions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimDecoderStats {
    pub packets: u64,
    pub bytes: u64,
    pub refused: u64,
    pub pictures: u64,
    pub released: u64,
    pub outstanding: usize,
    pub committed: usize,
    pub resolution_changes: u64,
    pub resets: u64,
}

#[derive(Copy, Clone, Debug)]
struct Packet {
    bytes: usize,
    eos: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pending {
    Picture,
    EndOfStream,
}

#[derive(Default)]
struct SimState {
    committed: Vec<BufferIdentity>,
    registered: bool,
    awaiting_ack: bool,
    announced: bool,
    second_announced: bool,
    next_slot: usize,
    pending: VecDeque<Pending>,
    outstanding: HashSet<u64>,
    finished: bool,
    stats: SimDecoderStats,
}

/// In-process decoder engine.
pub struct SimDecoder {
    config: SimDecoderConfig,
    input_tx: Sender<Packet>,
    input_rx: Receiver<Packet>,
    state: Mutex<SimState>,
}

impl SimDecoder {
    pub fn new(config: SimDecoderConfig) -> Self {
        let (input_tx, input_rx) = channel::bounded(config.queue_depth.max(1));
        Self {
            config,
            input_tx,
            input_rx,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.config.format
    }

    pub fn stats(&self) -> SimDecoderStats {
        let state = self.state.lock();
        SimDecoderStats {
            outstanding: state.outstanding.len(),
            committed: state.committed.len(),
            ..state.stats.clone()
        }
    }

    fn announce(&self, state: &mut SimState) -> FrameEvent<SimPicture> {
        state.awaiting_ack = true;
        state.stats.resolution_changes += 1;
        info!(
            width = self.config.format.width,
            height = self.config.format.height,
            "Simulated resolution change"
        );
        FrameEvent::ResolutionChanged(self.config.format)
    }

    /// Turn one queued item into an event. The state lock is held.
    fn emit(&self, state: &mut SimState, item: Pending) -> Result<FrameEvent<SimPicture>, DecodeError> {
        match item {
            Pending::EndOfStream => {
                state.finished = true;
                debug!(pictures = state.stats.pictures, "Simulated end of stream");
                Ok(FrameEvent::EndOfStream)
            }
            Pending::Picture => {
                if !state.announced {
                    state.announced = true;
                    state.pending.push_front(Pending::Picture);
                    return Ok(self.announce(state));
                }
                if let Some(after) = self.config.second_resolution_after {
                    if !state.second_announced && state.stats.pictures >= after {
                        state.second_announced = true;
                        state.pending.push_front(Pending::Picture);
                        return Ok(self.announce(state));
                    }
                }
                if state.awaiting_ack || !state.registered {
                    return Err(DecodeError::DecodeFailed {
                        picture: state.stats.pictures,
                        reason: "picture requested before the buffer handshake completed".into(),
                    });
                }
                if let Some(limit) = self.config.fail_after {
                    if state.stats.pictures >= limit {
                        return Err(DecodeError::DecodeFailed {
                            picture: state.stats.pictures,
                            reason: "simulated decode failure".into(),
                        });
                    }
                }

                let identity = if self.config.report_foreign_buffer {
                    BufferIdentity(-7)
                } else {
                    let slot = state.next_slot % state.committed.len();
                    state.next_slot = slot + 1;
                    state.committed[slot]
                };
                let sequence = state.stats.pictures;
                state.stats.pictures += 1;
                state.outstanding.insert(sequence);
                Ok(FrameEvent::PictureReady(SimPicture { identity, sequence }))
            }
        }
    }
}

impl Default for SimDecoder {
    fn default() -> Self {
        Self::new(SimDecoderConfig::default())
    }
}

impl DecoderEngine for SimDecoder {
    type Picture = SimPicture;

    fn submit_packet(&self, data: &[u8], is_eos: bool) -> Result<SubmitStatus, DecodeError> {
        let packet = Packet {
            bytes: data.len(),
            eos: is_eos,
        };
        match self.input_tx.try_send(packet) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.stats.packets += 1;
                state.stats.bytes += data.len() as u64;
                Ok(SubmitStatus::Accepted)
            }
            Err(TrySendError::Full(_)) => {
                self.state.lock().stats.refused += 1;
                Ok(SubmitStatus::WouldBlock)
            }
            Err(TrySendError::Disconnected(_)) => Err(DecodeError::InvalidSession),
        }
    }

    fn pull_event(&self) -> Result<FrameEvent<SimPicture>, DecodeError> {
        loop {
            {
                let mut state = self.state.lock();
                if state.finished {
                    return Ok(FrameEvent::EndOfStream);
                }
                if let Some(item) = state.pending.pop_front() {
                    return self.emit(&mut state, item);
                }
            }

            // Block without holding the state lock; commits and releases
            // may arrive from the caller in between.
            let packet = self
                .input_rx
                .recv()
                .map_err(|_| DecodeError::InvalidSession)?;

            let mut state = self.state.lock();
            if packet.bytes > 0 {
                state.pending.push_back(Pending::Picture);
            }
            if packet.eos {
                state.pending.push_back(Pending::EndOfStream);
            }
        }
    }

    fn commit_external_buffer(
        &self,
        descriptor: ExportDescriptor,
        size: u64,
    ) -> Result<BufferIdentity, DecodeError> {
        let mut state = self.state.lock();
        if state.registered && !state.awaiting_ack {
            return Err(DecodeError::BufferCommit(
                "buffer group already registered".into(),
            ));
        }
        let needed = self.config.format.buffer_size();
        if size < needed {
            return Err(DecodeError::BufferCommit(format!(
                "buffer of {size} bytes is smaller than the {needed} bytes a picture needs"
            )));
        }

        let identity = if self.config.duplicate_descriptors {
            BufferIdentity(descriptor.0 + DUPLICATE_OFFSET)
        } else {
            BufferIdentity(descriptor.0)
        };
        state.committed.push(identity);
        Ok(identity)
    }

    fn register_external_buffer_group(&self) -> Result<(), DecodeError> {
        let mut state = self.state.lock();
        if state.committed.is_empty() {
            return Err(DecodeError::Control {
                call: "register_external_buffer_group",
                reason: "no buffers committed".into(),
            });
        }
        state.registered = true;
        Ok(())
    }

    fn acknowledge_resolution_ready(&self) -> Result<(), DecodeError> {
        let mut state = self.state.lock();
        if !state.awaiting_ack {
            return Err(DecodeError::NoPendingResolution);
        }
        if !state.registered {
            return Err(DecodeError::Control {
                call: "acknowledge_resolution_ready",
                reason: "buffer group not registered".into(),
            });
        }
        state.awaiting_ack = false;
        Ok(())
    }

    fn release_picture(&self, picture: SimPicture) {
        let mut state = self.state.lock();
        state.outstanding.remove(&picture.sequence);
        state.stats.released += 1;
    }

    fn reset(&self) -> Result<(), DecodeError> {
        loop {
            match self.input_rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let mut state = self.state.lock();
        state.pending.clear();
        state.stats.resets += 1;
        debug!(outstanding = state.outstanding.len(), "Simulated decoder reset");
        Ok(())
    }
}
