use std::collections::VecDeque;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::events::PendingEvent;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Change events produced by the current request; drained by the
    /// router after the handler returns.
    pub pending: VecDeque<PendingEvent>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            pending: VecDeque::new(),
        }
    }
}
