//! `scanloc-middleware` – output plumbing for the localizer.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels. Poses, transforms, aligned scans, alignment metrics
//!   and diagnostics each travel on their own lane.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
