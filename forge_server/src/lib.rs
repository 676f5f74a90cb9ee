//! ImageForge server — builds VM disk images, smoke-tests them on a
//! disposable instance, and promotes passing candidates into the
//! production image name.

pub mod cloud;
pub mod config;
pub mod distro;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod test_support;
