pub mod agent;
pub mod score;
pub mod session;
pub mod signal;
pub mod task;
