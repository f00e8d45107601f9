//! Custom Resource Definitions for driftwatch
//!
//! `Application` describes what to deploy and where, `AppProject` restricts
//! what a group of applications may do.

mod app_project;
mod application;
pub mod types;


pub use app_project::{AppProject, AppProjectSpec};
pub use application::{
    Application, ApplicationSpec, API_GROUP, API_VERSION, APPLICATION_KIND,
    DEFAULT_REVISION_HISTORY_LIMIT,
};
pub use types::*;
