pub mod credits;
pub mod hub;
pub mod jobs;
pub mod pipeline;
pub mod provider_health;
pub mod providers;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod worker;
