pub mod flat;
pub mod recovery;
pub mod sqlite;

pub use flat::FlatVectorIndex;
pub use recovery::Recovery;
pub use sqlite::SqliteVectorIndex;

use crate::config::VectorBackendKind;
use crate::error::IndexError;
use crate::traits::VectorIndex;
use recovery::open_with_recovery;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Opens the configured backend, repairing corrupted storage on the way.
pub fn open_index(
    kind: VectorBackendKind,
    directory: &Path,
) -> Result<(Arc<dyn VectorIndex>, Recovery), IndexError> {
    let (index, recovery): (Arc<dyn VectorIndex>, Recovery) = match kind {
        VectorBackendKind::Sqlite => {
            let (index, recovery) = open_with_recovery::<SqliteVectorIndex>(directory)?;
            (Arc::new(index), recovery)
        }
        VectorBackendKind::Flat => {
            let (index, recovery) = open_with_recovery::<FlatVectorIndex>(directory)?;
            (Arc::new(index), recovery)
        }
    };

    info!(
        backend = index.backend(),
        directory = %directory.display(),
        ?recovery,
        "vector index opened"
    );
    Ok((index, recovery))
}
