//! Feeder: pushes the elementary stream into the decoder.
//!
//! Runs on the caller's thread. The stream is read in fixed-size chunks;
//! every chunk is submitted until the decoder accepts it, sleeping for the
//! backoff while its input queue is full. At end of input an empty packet
//! flagged end-of-stream is submitted, which is what eventually stops the
//! harvester and the presenter.

use std::io::{ErrorKind, Read};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use rk_common::{DecoderEngine, SubmitStatus};

use crate::context::PipelineContext;
use crate::error::PipelineError;

/// Feeder counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub bytes: u64,
    pub packets: u64,
    /// Submissions refused because the decoder queue was full.
    pub retries: u64,
    pub eos_sent: bool,
}

pub struct Feeder<'a, D: DecoderEngine> {
    decoder: &'a D,
    ctx: &'a PipelineContext,
    packet_size: usize,
    backoff: Duration,
    stats: FeedStats,
}

impl<'a, D: DecoderEngine> Feeder<'a, D> {
    pub fn new(
        decoder: &'a D,
        ctx: &'a PipelineContext,
        packet_size: usize,
        backoff: Duration,
    ) -> Self {
        Self {
            decoder,
            ctx,
            packet_size: packet_size.max(1),
            backoff,
            stats: FeedStats::default(),
        }
    }

    /// Feed `reader` to the decoder, then send end of stream.
    ///
    /// End of stream is sent even when reading or submitting fails, so the
    /// workers can drain.
    pub fn feed<R: Read>(mut self, reader: R) -> Result<FeedStats, PipelineError> {
        let pumped = self.pump(reader);
        if let Err(e) = &pumped {
            warn!(error = %e, "Feeding stopped early");
        }
        let finished = self.finish();
        info!(
            bytes = self.stats.bytes,
            packets = self.stats.packets,
            retries = self.stats.retries,
            "Stream fed"
        );
        pumped.and(finished).map(|()| self.stats)
    }

    fn pump<R: Read>(&mut self, mut reader: R) -> Result<(), PipelineError> {
        let mut buffer = vec![0u8; self.packet_size];
        loop {
            if self.ctx.is_halted() {
                return Err(PipelineError::Halted);
            }

            let read = match reader.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.backoff);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !self.submit(&buffer[..read], false)? {
                return Err(PipelineError::Halted);
            }
            self.stats.bytes += read as u64;
            self.stats.packets += 1;
        }
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        debug!("Submitting end-of-stream packet");
        self.stats.eos_sent = self.submit(&[], true)?;
        if !self.stats.eos_sent {
            warn!("End of stream not delivered, decoder no longer drained");
        }
        Ok(())
    }

    /// Submit one packet, retrying while the decoder queue is full.
    ///
    /// Returns `false` if the harvester has exited, in which case the queue
    /// will never drain.
    fn submit(&mut self, data: &[u8], is_eos: bool) -> Result<bool, PipelineError> {
        loop {
            match self.decoder.submit_packet(data, is_eos)? {
                SubmitStatus::Accepted => return Ok(true),
                SubmitStatus::WouldBlock => {
                    if self.ctx.harvester_exited() {
                        return Ok(false);
                    }
                    self.stats.retries += 1;
                    thread::sleep(self.backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_decoder::{SimDecoder, SimDecoderConfig};
    use std::io::Cursor;

    /// Reader that fails with `Interrupted` before every successful read.
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                Err(ErrorKind::Interrupted.into())
            } else {
                self.inner.read(buf)
            }
        }
    }

    #[test]
    fn splits_input_into_packets_and_sends_eos() {
        let decoder = SimDecoder::new(SimDecoderConfig {
            queue_depth: 16,
            ..Default::default()
        });
        let ctx = PipelineContext::new();
        let input = Cursor::new(vec![7u8; 250]);

        let stats = Feeder::new(&decoder, &ctx, 100, Duration::from_millis(1))
            .feed(input)
            .unwrap();
        assert_eq!(stats.bytes, 250);
        assert_eq!(stats.packets, 3);
        assert!(stats.eos_sent);
        // 3 data packets + 1 empty EOS packet
        assert_eq!(decoder.stats().packets, 4);
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let decoder = SimDecoder::new(SimDecoderConfig {
            queue_depth: 16,
            ..Default::default()
        });
        let ctx = PipelineContext::new();
        let input = Flaky {
            inner: Cursor::new(vec![1u8; 64]),
            interrupt: false,
        };
        let stats = Feeder::new(&decoder, &ctx, 32, Duration::from_millis(1))
            .feed(input)
            .unwrap();
        assert_eq!(stats.packets, 2);
    }

    #[test]
    fn full_queue_is_retried_until_drained() {
        let decoder = std::sync::Arc::new(SimDecoder::new(SimDecoderConfig {
            queue_depth: 1,
            ..Default::default()
        }));
        let ctx = PipelineContext::new();

        // Drain the decoder from another thread so the feeder's retries
        // eventually succeed.
        let drain = {
            let decoder = decoder.clone();
            std::thread::spawn(move || {
                use rk_common::FrameEvent;
                let mut pulled = 0;
                loop {
                    match decoder.pull_event().unwrap() {
                        FrameEvent::ResolutionChanged(format) => {
                            let size = format.buffer_size();
                            decoder
                                .commit_external_buffer(rk_common::ExportDescriptor(3), size)
                                .unwrap();
                            decoder.register_external_buffer_group().unwrap();
                            decoder.acknowledge_resolution_ready().unwrap();
                        }
                        FrameEvent::PictureReady(picture) => {
                            pulled += 1;
                            decoder.release_picture(picture);
                        }
                        FrameEvent::EndOfStream => return pulled,
                    }
                }
            })
        };

        let stats = Feeder::new(&*decoder, &ctx, 8, Duration::from_millis(1))
            .feed(Cursor::new(vec![0u8; 64]))
            .unwrap();
        assert_eq!(stats.packets, 8);
        assert_eq!(drain.join().unwrap(), 8);
    }

    #[test]
    fn halt_stops_reading_but_still_sends_eos() {
        let decoder = SimDecoder::new(SimDecoderConfig {
            queue_depth: 4,
            ..Default::default()
        });
        let ctx = PipelineContext::new();
        ctx.halt();
        let err = Feeder::new(&decoder, &ctx, 16, Duration::from_millis(1))
            .feed(Cursor::new(vec![0u8; 64]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Halted));
        // Only the EOS packet went in.
        assert_eq!(decoder.stats().packets, 1);
        assert_eq!(decoder.stats().bytes, 0);
    }

    #[test]
    fn gives_up_when_nobody_drains() {
        let decoder = SimDecoder::new(SimDecoderConfig {
            queue_depth: 1,
            ..Default::default()
        });
        let ctx = PipelineContext::new();
        ctx.mark_harvester_exited();
        let err = Feeder::new(&decoder, &ctx, 16, Duration::from_millis(1))
            .feed(Cursor::new(vec![0u8; 64]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Halted));
        assert_eq!(decoder.stats().packets, 1);
    }
}
