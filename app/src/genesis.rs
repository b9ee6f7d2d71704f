//! Genesis document
//!
//! The document handed to InitChain: chain identity plus one JSON fragment
//! per module under `app_state`.

use crate::{manager::GenesisState, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Genesis file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisDoc {
    /// Time of the first block
    pub genesis_time: DateTime<Utc>,
    /// Chain identifier
    pub chain_id: String,
    /// Module fragments by module name
    #[serde(default)]
    pub app_state: GenesisState,
}

impl GenesisDoc {
    /// Document with the given fragments
    pub fn new(chain_id: impl Into<String>, genesis_time: DateTime<Utc>, app_state: GenesisState) -> Self {
        Self {
            genesis_time,
            chain_id: chain_id.into(),
            app_state,
        }
    }

    /// Read a JSON genesis file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let doc: GenesisDoc = serde_json::from_str(&content)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Write as pretty JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Encoded `app_state`, as sent by the consensus engine
    pub fn app_state_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.app_state)?)
    }

    /// Decode `app_state` bytes; empty bytes give an empty state
    pub fn parse_app_state(bytes: &[u8]) -> Result<GenesisState> {
        if bytes.is_empty() {
            return Ok(GenesisState::new());
        }
        serde_json::from_slice(bytes).map_err(|e| Error::Genesis(format!("malformed app state: {}", e)))
    }

    /// Identity checks
    pub fn validate(&self) -> Result<()> {
        let chain_id = self.chain_id.trim();
        if chain_id.is_empty() {
            return Err(Error::Genesis("chain_id cannot be empty".into()));
        }
        if chain_id.len() > 50 {
            return Err(Error::Genesis(format!("chain_id too long: {}", chain_id.len())));
        }
        Ok(())
    }
}
