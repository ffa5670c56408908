pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hub;
pub mod library;
pub mod settings;
pub mod slideshow;
pub mod storage;
pub mod web;
pub mod processing {
    pub mod encode;
    pub mod orientation;
    pub mod pipeline;
    pub mod resize;
}

pub use error::{Error, Result};
