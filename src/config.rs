//! Storage configuration string parsing
//!
//! Configurations are `key=value` pairs separated by `;`, e.g.
//! `path=/srv/index;metadata=doclen:uint16,date:uint32;cache=4M;acl=yes`.
//! Keys are case insensitive and may appear only once.

use crate::error::{Result, StorageError};

/// Parsed storage create/open options.
///
/// `path` is mandatory. `metadata` is only honored when creating a storage;
/// an existing storage keeps its persisted schema.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub path: String,
    pub metadata: String,
    pub cachedterms: String,
    pub cache_size: usize,
    pub acl: bool,
    pub compression: bool,
}

impl StorageConfig {
    pub fn parse(source: &str) -> Result<Self> {
        let mut cfg = StorageConfig {
            compression: true,
            cache_size: DEFAULT_CACHE_SIZE,
            ..Default::default()
        };
        let mut seen: Vec<String> = Vec::new();
        for item in source.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item.split_once('=').ok_or_else(|| {
                StorageError::Config(format!("'=' expected after item identifier in '{}'", item))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if seen.contains(&key) {
                return Err(StorageError::Config(format!(
                    "duplicate definition of '{}' in storage config",
                    key
                )));
            }
            if value.is_empty() {
                return Err(StorageError::Config(format!(
                    "empty definition of '{}' in storage config",
                    key
                )));
            }
            match key.as_str() {
                "path" => cfg.path = value.to_string(),
                "metadata" => cfg.metadata = value.to_string(),
                "cachedterms" => cfg.cachedterms = value.to_string(),
                "cache" => cfg.cache_size = parse_size(value)?,
                "acl" => cfg.acl = parse_yes_no("acl", value)?,
                "compression" => cfg.compression = parse_yes_no("compression", value)?,
                _ => {
                    return Err(StorageError::Config(format!(
                        "unknown configuration option '{}'",
                        key
                    )))
                }
            }
            seen.push(key);
        }
        if cfg.path.is_empty() {
            return Err(StorageError::Config(
                "missing mandatory configuration option 'path'".into(),
            ));
        }
        Ok(cfg)
    }
}

/// Default metadata cache budget in bytes when no `cache=` option is given.
pub const DEFAULT_CACHE_SIZE: usize = 1024 * 1024;

/// Parse a byte count with an optional K/M/G suffix.
fn parse_size(numstr: &str) -> Result<usize> {
    let mut value: usize = 0;
    let mut chars = numstr.chars().peekable();
    let mut any_digit = false;
    while let Some(&c) = chars.peek() {
        if let Some(d) = c.to_digit(10) {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(d as usize))
                .ok_or_else(|| StorageError::Config(format!("size too large: '{}'", numstr)))?;
            any_digit = true;
            chars.next();
        } else {
            break;
        }
    }
    let mult = match chars.next() {
        None => 1,
        Some('K') | Some('k') => 1024,
        Some('M') | Some('m') => 1024 * 1024,
        Some('G') | Some('g') => 1024 * 1024 * 1024,
        Some(c) => {
            return Err(StorageError::Config(format!(
                "not a number with optional K/M/G suffix ('{}' at '{}')",
                numstr, c
            )))
        }
    };
    if !any_digit || chars.next().is_some() {
        return Err(StorageError::Config(format!(
            "not a number with optional K/M/G suffix: '{}'",
            numstr
        )));
    }
    Ok(value * mult)
}

fn parse_yes_no(cfgname: &str, s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "y" | "t" | "yes" | "true" | "1" => Ok(true),
        "n" | "f" | "no" | "false" | "0" => Ok(false),
        _ => Err(StorageError::Config(format!(
            "value for configuration option '{}' is not a boolean (yes/no)",
            cfgname
        ))),
    }
}
