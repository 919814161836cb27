#![forbid(unsafe_code)]

pub mod cache;
pub mod cli;
pub mod epub;
pub mod export;
pub mod fingerprint;
pub mod html;
pub mod logging;
pub mod marker;
pub mod model;
pub mod placeholder;
pub mod recover;
pub mod resume;
