//! Client side of gallerysync: submit an image with a description, then
//! reconcile processed results pushed back by the service into an ordered
//! gallery.

pub mod channel;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod gallery;
pub mod pending;
pub mod session;

pub use channel::{Channel, ChannelConfig, LoopbackPeer, Subscription};
pub use config::ClientConfig;
pub use controller::{FormState, SubmissionController, SubmissionPhase, SubmitOutcome};
pub use error::{EncodeError, SubmitError, TransportError, ValidationError};
pub use gallery::{DuplicatePolicy, GallerySnapshot, GalleryStore, ProcessedItem};
pub use pending::{PendingSubmission, PendingTracker, SharedPending};
pub use session::GalleryView;
