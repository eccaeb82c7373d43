//! Configuration module for sessionkeeper.
//!
//! Manages client configuration stored in SQLite.

mod settings;

pub use settings::{
    ClientConfig, DEFAULT_BASE_URL, DEFAULT_LOGIN_ROUTE, DEFAULT_REFRESH_PATH,
    DEFAULT_TIMEOUT_SECS, ENV_BASE_URL, ENV_TIMEOUT_SECS, EXPIRED_TOKEN_CODE,
};
