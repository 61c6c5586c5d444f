use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::model::Actor;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: Config,
    /// `--config` given on the command line; when absent each selected
    /// workspace may bring its own `educonnect.toml`.
    pub config_path: Option<PathBuf>,
    pub actor: Option<Actor>,
}

impl AppState {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            workspace: None,
            db: None,
            config,
            config_path,
            actor: None,
        }
    }
}

/// Successful handler output before it is wrapped into a response line.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub data: Value,
    pub pagination: Option<Value>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data,
            pagination: None,
        }
    }

    pub fn created(data: Value) -> Self {
        Self {
            status: 201,
            data,
            pagination: None,
        }
    }

    pub fn paged(data: Value, pagination: Value) -> Self {
        Self {
            status: 200,
            data,
            pagination: Some(pagination),
        }
    }
}
