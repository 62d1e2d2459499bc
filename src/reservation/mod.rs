//! SCSI/NVMe persistent-reservation engine (spec §4.E): key derivation,
//! key-file persistence, and the start/stop/remove/clear/extend/status
//! protocols against the external `lvmpersist` helper.

pub mod engine;
pub mod key;
pub mod keyfile;

pub use engine::{AccessMode, DeviceClass, ExtendAction, PvObservation, PvStatus, ReservationType};
pub use key::KeySource;
