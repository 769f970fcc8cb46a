//! Background loops that turn the Queue Service, Template Engine, MIME
//! composer and SMTP transport into a running email worker (§4.2, §4.6-§4.8).

pub mod cleanup;
pub mod dispatch;
mod diskusage;
pub mod health;
pub mod pipeline;
pub mod scheduler;

pub use cleanup::CleanupLoop;
pub use dispatch::DispatchLoop;
pub use health::HealthLoop;
pub use scheduler::SchedulerLoop;
