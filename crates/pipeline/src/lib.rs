//! `rk-pipeline`: Decode-to-display pipeline for the rkplay workspace.
//!
//! Ties a [`DecoderEngine`](rk_common::DecoderEngine) to a
//! [`DisplaySurfaceProvider`](rk_common::DisplaySurfaceProvider) with
//! zero-copy frame sharing:
//!
//! - **pool**: `BufferPoolManager` allocates display buffers, exports them
//!   and lends them to the decoder, then maps decoder buffers to surfaces
//! - **feeder**: pushes the elementary stream into the decoder with backoff
//! - **harvester**: drains decoder events and publishes surfaces
//! - **mailbox**: latest-frame-wins handoff between harvester and presenter
//! - **presenter**: puts the newest surface on the overlay plane
//! - **pipeline**: thread orchestration, fatal policy and ordered teardown
//!
//! # Usage
//!
//! ```ignore
//! use rk_pipeline::{Pipeline, PipelineConfig};
//!
//! let report = Pipeline::new(Arc::new(decoder), Arc::new(display), PipelineConfig::default())
//!     .run(std::fs::File::open("clip.h264")?)?;
//! println!("{} pictures, {} skipped", report.pictures_decoded, report.pictures_skipped);
//! ```

pub mod context;
pub mod error;
pub mod feeder;
pub mod harvester;
pub mod mailbox;
pub mod pipeline;
pub mod pool;
pub mod presenter;
pub mod rect;
pub mod state;

pub use context::{Geometry, PipelineContext};
pub use error::{PipelineError, PoolError};
pub use feeder::{FeedStats, Feeder};
pub use harvester::{HarvestStats, Harvester, HarvesterExit};
pub use mailbox::{Delivery, Mailbox, MailboxStats};
pub use pipeline::{abort_on_fatal, FatalHook, Pipeline, PipelineConfig, PlaybackReport};
pub use pool::{BufferPool, BufferPoolManager, PoolEntry};
pub use presenter::{PresentStats, Presenter};
pub use rect::output_rect;
pub use state::PipelineState;
