pub mod agent;
pub mod memory;
pub mod plan;
pub mod session;
pub mod tooling;
