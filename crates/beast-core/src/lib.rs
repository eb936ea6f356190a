//! beast-core: shared types for the Beast relay: configuration, the Beast
//! frame counter, and connection-origin types. All other crates depend on
//! this one.

pub mod config;
pub mod frame;
pub mod origin;

pub use frame::{count_frames, FrameCount};
pub use origin::{parse_range, CidrError, Origin};
pub use ipnet::IpNet;
