#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod auth;
pub mod chat;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod server;
pub mod session;
pub mod storage;
pub mod widget;

pub use error::{Error, Result};
pub use widget::{ChatWidget, Exchange};
