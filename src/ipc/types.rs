use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::store::TeacherStore;

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
    /// One reconciliation store per teacher seen this session.
    pub stores: HashMap<String, TeacherStore>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            stores: HashMap::new(),
        }
    }
}
