mod app_state;
pub mod background;

pub use app_state::EngineState;
pub use background::{BackgroundTask, BackgroundTasks, CleanupReport, UpdateStatus};
