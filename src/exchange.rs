//! Parameter exchange file.
//!
//! After each successful compile the discovered parameter names are written
//! to a client-supplied path so the client can map names to positions. The
//! format is plain UTF-8: every name followed by `$`. Names are not escaped,
//! a `$` inside a label splits it on the reading side.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Entry delimiter.
pub const DELIMITER: char = '$';

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("could not write exchange file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read exchange file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Encode names as `name$name$...`.
pub fn encode_names<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for name in names {
        if name.contains(DELIMITER) {
            warn!(name, "parameter name contains the exchange delimiter");
        }
        out.push_str(name);
        out.push(DELIMITER);
    }
    out
}

/// Split an exchange payload back into names.
pub fn decode_names(payload: &str) -> Vec<String> {
    payload
        .split_terminator(DELIMITER)
        .map(str::to_owned)
        .collect()
}

/// Overwrite `path` with the encoded names.
pub fn write_param_names<'a, I>(path: &Path, names: I) -> Result<(), ExchangeError>
where
    I: IntoIterator<Item = &'a str>,
{
    fs::write(path, encode_names(names)).map_err(|source| ExchangeError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the names back from `path`.
pub fn read_param_names(path: &Path) -> Result<Vec<String>, ExchangeError> {
    let payload = fs::read_to_string(path).map_err(|source| ExchangeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode_names(&payload))
}
