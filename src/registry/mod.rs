// Image Distribution Client
//
// Pulls multi-part VM disk images from an OCI-style registry into a local
// content cache and image store.

pub mod assemble;
pub mod cache;
pub mod error;
pub mod index;
pub mod manifest;
pub mod mock;
pub mod pull;
pub mod reference;
pub mod transport;

pub use error::{PullError, PullResult};
pub use index::{ImageIndex, ImageRecord};
pub use pull::{JobState, PruneReport, PullJob, Puller};
pub use reference::ImageReference;
pub use transport::{HttpRegistry, RegistryTransport};
