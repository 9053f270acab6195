//! Virtual filesystem and shared-memory primitives for FerroDB.

pub mod memory;
pub mod shm;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use memory::{MemoryFile, MemoryVfs};
pub use shm::{ShmConnectionId, ShmDirectory, ShmHandle, ShmRegion};
pub use traits::{Vfs, VfsFile};
#[cfg(unix)]
pub use unix::{UnixFile, UnixVfs};
