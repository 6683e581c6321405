// Camera Central - MP4 conversion library
//
// Shared by the `mp4-converter` daemon and the `camctl` operator tool.

pub mod constants;
pub mod error;
pub mod tools;
pub mod config;
pub mod logging;
pub mod db;
pub mod media;
pub mod jobs;

pub use error::{ConvertError, Result};
