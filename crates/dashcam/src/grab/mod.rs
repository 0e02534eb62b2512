//! Companion-side helpers
//!
//! The grab process sits next to the camera: it pulses the trigger line and
//! collects stills that peers push to it over TCP.

pub mod pulse;
pub mod receiver;

pub use pulse::{run_heartbeat, send_pulse, PulseConfig};
pub use receiver::{upload_path, ReceiverConfig, UploadReceiver};
