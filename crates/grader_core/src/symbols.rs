use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::GraderError;
use crate::Result;

/// Symbol name to address lookup backed by `nm`-style text tables.
///
/// Lines are either `address name` or `address type name`; anything else is skipped.
/// When a name appears more than once the first address wins.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut table = Self::new();
        table.extend_from_text(text);
        table
    }

    /// Loads every table in `paths`. Missing files contribute no symbols.
    pub async fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut table = Self::new();
        for path in paths {
            let path = path.as_ref();
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    table.extend_from_text(&String::from_utf8_lossy(&bytes));
                    debug!(path = %path.display(), symbols = table.len(), "loaded symbol table");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "symbol table not present");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(table)
    }

    fn extend_from_text(&mut self, text: &str) {
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (address, name) = match fields.as_slice() {
                [address, name] => (address, name),
                [address, _, name, ..] => (address, name),
                _ => continue,
            };
            let digits = address.trim_start_matches("0x").trim_start_matches("0X");
            let Ok(address) = u64::from_str_radix(digits, 16) else {
                continue;
            };
            self.symbols.entry((*name).to_string()).or_insert(address);
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn lookup(&self, name: &str) -> Result<u64> {
        self.get(name)
            .ok_or_else(|| GraderError::SymbolNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
