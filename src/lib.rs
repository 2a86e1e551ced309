//! Organizes independently-versioned dataset repositories into study
//! repositories. Datasets are linked by exact revision through gitlinks and
//! `.gitmodules` entries; their content is never fetched.

pub mod app;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod git;
pub mod linker;
pub mod output;
pub mod planner;
pub mod state;
pub mod store;
pub mod study_repo;
pub mod unresolved;
