pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod lockfile;
pub mod locks;
pub mod planner;
pub mod signature;
pub mod store;
pub mod types;
pub mod vcs;
