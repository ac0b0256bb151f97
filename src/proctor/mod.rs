//! Academic-integrity detectors: face presence, tab visibility and clipboard
//! use, turned into rate-limited alerts.

mod camera;
mod capability;
mod controller;
mod cooldown;
mod face;
mod pipeline;
mod visibility;

pub use camera::{CameraLease, CameraSlot};
pub use capability::{
    CommandPresenceCapability, PresenceCapability, PresenceSensor, ScriptedPresenceCapability,
};
pub use controller::{ProctorContext, ProctorController};
pub use cooldown::CooldownFilter;
pub use face::{FaceDebounce, FacePresenceMonitor, MonitorStatus, PresenceChange};
pub use pipeline::{
    HostSignal, PendingAlert, PipelineInput, PipelineOutput, ProctorEvent, ViolationPipeline,
};
pub use visibility::{TabEvent, TabWarnings};
