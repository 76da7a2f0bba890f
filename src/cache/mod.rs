mod state;

pub use state::{CacheLookup, CacheState, PathmanState};
