//! Run-state persistence.
//!
//! The whole logical state of a run — phase, shells (geometry and classifier
//! parameters included), point store, live set, call counter and an RNG
//! reseed token — is one serde value written with bincode. Resuming from it
//! is statistically equivalent to an uninterrupted run; the RNG stream is
//! reseeded rather than restored bit-for-bit.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::points::PointStore;
use crate::shell::Shell;

/// Bumped whenever the serialized layout changes incompatibly.
const FORMAT_VERSION: u32 = 1;

/// Phase of the sampler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Exploring,
    Sampling,
    Done,
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    version: u32,
    pub config: Config,
    pub ndim: usize,
    pub phase: Phase,
    pub shells: Vec<Shell>,
    pub store: PointStore,
    pub live: Vec<usize>,
    pub n_like: usize,
    /// Accepted points since the last shell was built.
    pub n_accepted_since_shell: usize,
    /// Seed for the continuation's RNG stream, drawn at save time.
    pub rng_reseed: u64,
}

impl RunState {
    pub fn new(config: Config, ndim: usize, rng_reseed: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            config,
            ndim,
            phase: Phase::Exploring,
            shells: Vec::new(),
            store: PointStore::new(),
            live: Vec::new(),
            n_like: 0,
            n_accepted_since_shell: 0,
            rng_reseed,
        }
    }
}

/// Writes `state` to `path`.
pub fn save_state(path: &Path, state: &RunState) -> Result<()> {
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), state)
        .map_err(|e| Error::CheckpointCorruption(format!("encode failed: {e}")))
}

/// Reads a state back, rejecting malformed or incompatible files.
pub fn load_state(path: &Path) -> Result<RunState> {
    let file = File::open(path)?;
    let state: RunState = bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| Error::CheckpointCorruption(format!("decode failed: {e}")))?;
    if state.version != FORMAT_VERSION {
        return Err(Error::CheckpointCorruption(format!(
            "format version {} (expected {FORMAT_VERSION})",
            state.version
        )));
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");

        let mut state = RunState::new(Config::default().with_seed(3), 2, 17);
        state.shells.push(Shell::root(2));
        state
            .store
            .push(vec![0.1, 0.2], vec![1.0, 2.0], -0.5, 0, true, true);
        state.live.push(0);
        state.n_like = 1;

        save_state(&path, &state).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.ndim, 2);
        assert_eq!(loaded.phase, Phase::Exploring);
        assert_eq!(loaded.n_like, 1);
        assert_eq!(loaded.rng_reseed, 17);
        assert_eq!(loaded.store.len(), 1);
        assert_eq!(loaded.live, vec![0]);
    }

    #[test]
    fn garbage_is_reported_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ckpt");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"not a checkpoint").unwrap();
        drop(file);
        assert!(matches!(
            load_state(&path),
            Err(Error::CheckpointCorruption(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ckpt");
        assert!(matches!(load_state(&path), Err(Error::Io(_))));
    }
}
