pub mod event;
pub mod generation;
pub mod job;
pub mod video;
