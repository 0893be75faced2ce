//! rust_scan: a 4DOF photogrammetric scanner controller.
//!
//! The workspace crates do the actual work; this crate re-exports them under
//! one roof and hosts the thin CLI binary.
//!
//! - [`scan_core`]: shared types, error taxonomy, capability traits, config
//! - [`scan_motion`]: FluidNC serial link, protocol monitor, motion control
//! - [`scan_camera`]: dual-mode sensors and exposure/focus calibration
//! - [`scan_lighting`]: zoned LED flash array
//! - [`scan_patterns`]: grid / cylindrical / spherical point generation
//! - [`scan_storage`]: sessions, positions files, EXIF/JPEG persistence
//! - [`scan_engine`]: scan state and the orchestrator
//! - [`scan_sim`]: simulated hardware for tests and dry runs

pub use scan_camera;
pub use scan_core;
pub use scan_engine;
pub use scan_lighting;
pub use scan_motion;
pub use scan_patterns;
pub use scan_sim;
pub use scan_storage;
