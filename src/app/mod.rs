pub mod adb;
pub mod capture;
pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod logcat;
pub mod logging;
pub mod models;
pub mod packages;
pub mod state;
pub mod text_block;

#[cfg(test)]
pub mod test_support;
