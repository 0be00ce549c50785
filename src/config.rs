//! Fixed settings for brokenterm.
//!
//! The key bindings, line capacity and teardown grace period are compile-time
//! defaults. Nothing is read from disk; the only path resolved here is the
//! data directory that holds the log file.

use std::path::PathBuf;
use std::time::Duration;

/// Default line buffer capacity
pub const DEFAULT_LINE_CAPACITY: usize = 1024;

/// How long peers get to drain on normal exit before they are killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Byte produced by Ctrl+K
pub const CTRL_K: u8 = 11;

/// Session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Line buffer capacity; one slot is reserved, so lines hold capacity - 1 bytes
    pub line_capacity: usize,
    /// Grace period for peers to drain before they are killed
    pub shutdown_grace: Duration,
    /// Key bindings
    pub keys: KeyMap,
}

impl Config {
    pub const DEFAULT: Config = Config {
        line_capacity: DEFAULT_LINE_CAPACITY,
        shutdown_grace: SHUTDOWN_GRACE,
        keys: KeyMap::DEFAULT,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Single-byte key bindings used by the stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMap {
    pub submit: u8,
    pub terminate: u8,
    pub kill: u8,
    pub line_kill: u8,
    pub backspace: u8,
    pub remap_from: u8,
    pub remap_to: u8,
}

impl KeyMap {
    pub const DEFAULT: KeyMap = KeyMap {
        submit: b'E',
        terminate: b'T',
        kill: CTRL_K,
        line_kill: b'K',
        backspace: b'X',
        remap_from: b'a',
        remap_to: b'z',
    };
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// `~/.brokenterm`, where the log lives
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".brokenterm"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_bindings() {
        let config = Config::default();
        assert_eq!(config.line_capacity, 1024);
        assert_eq!(config.shutdown_grace, Duration::from_millis(200));
        assert_eq!(config.keys, KeyMap::DEFAULT);
        assert_eq!(config.keys.kill, 11);
        assert_eq!(config.keys.submit, b'E');
        assert_eq!(config.keys.terminate, b'T');
    }

    #[test]
    fn test_input_stage_keys_do_not_collide() {
        // Kill, submit and terminate are matched in that order by the input
        // stage, and the editing keys must reach the translator untouched.
        let keys = KeyMap::DEFAULT;
        let bound = [
            keys.kill,
            keys.submit,
            keys.terminate,
            keys.line_kill,
            keys.backspace,
            keys.remap_from,
        ];
        for (i, a) in bound.iter().enumerate() {
            for b in &bound[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_data_dir_under_home() {
        if let Some(dir) = data_dir() {
            assert!(dir.ends_with(".brokenterm"));
        }
    }
}
