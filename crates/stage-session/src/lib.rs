//! Session lifecycle for a sandboxed program running on top of the overlay
//! filesystem: launch, main-loop stepping, error capture and reset.

mod controller;
mod diagnostics;
mod export;
mod host;
mod params;

pub use controller::{ResetOutcome, ResetStep, SessionController, SessionError, SessionState};
pub use diagnostics::{ErrorCollector, ErrorReport};
pub use export::{export_file, ExportedFile};
pub use host::{
    AudioChannel, AudioState, LaunchError, LoadedModule, MemoryModuleRegistry, ModuleRegistry,
    ProgramHost,
};
pub use params::{
    load_params, InlineFile, LaunchCommand, LaunchParams, LaunchPlan, ProgramInvocation,
};
