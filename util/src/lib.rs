//! Standalone diagnostic binaries; see `src/bin/`.
