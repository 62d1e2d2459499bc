//! Core engine for logical-volume management: a block cache, the in-memory
//! VG/LV metadata model and its transaction protocol, a lock-daemon client,
//! and a persistent-reservation engine.

pub mod cache;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod radix;
pub mod reservation;
pub mod utils;
pub mod uuid;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use uuid::Uuid;
