mod state_store;
mod syncer;

pub use state_store::{DirectoryBackedPersistentStateStore, PersistentState};
pub use syncer::{BlockPutSyncTask, BlockReleaseSyncTask, PeriodicSyncer};
