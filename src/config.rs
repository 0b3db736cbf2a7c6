use std::env;
use std::str::FromStr;

use crate::Error;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;
const DEFAULT_READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Connection level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Largest reply, in bytes, a connection will buffer before giving up on it.
    pub max_frame_size: usize,
    /// Initial capacity of the read buffer of each connection.
    pub read_buffer_capacity: usize,
}

impl Config {
    /// Reads `MAX_FRAME_SIZE` and `READ_BUFFER_CAPACITY`, falling back to the defaults when a
    /// variable is unset.
    pub fn from_env() -> Result<Config, Error> {
        let defaults = Config::default();

        Ok(Config {
            max_frame_size: var_or("MAX_FRAME_SIZE", defaults.max_frame_size)?,
            read_buffer_capacity: var_or("READ_BUFFER_CAPACITY", defaults.read_buffer_capacity)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
        }
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::invalid_usage(format!("{} must be a number, got {:?}", name, value))),
        Err(_) => Ok(default),
    }
}
