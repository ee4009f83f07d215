//! Access to the dataset's label voxels.

use crate::geometry::Coordinate;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Synchronous "read voxel at position" query supplied by the dataset layer.
///
/// The skeleton calls this while it holds its lock, so implementations must
/// answer from already-loaded data and must not call back into the skeleton.
pub trait VoxelSource: Send + Sync {
    /// Subobject label at `position`, or `None` if unknown or unloaded.
    fn voxel_at(&self, position: Coordinate) -> Option<u64>;
}

/// Optional shared voxel source held by the store.
#[derive(Clone, Default)]
pub(crate) struct VoxelLookup(Option<Arc<dyn VoxelSource>>);

impl VoxelLookup {
    pub(crate) fn set(&mut self, source: Option<Arc<dyn VoxelSource>>) {
        self.0 = source;
    }

    pub(crate) fn lookup(&self, position: Coordinate) -> Option<u64> {
        self.0.as_ref().and_then(|source| source.voxel_at(position))
    }
}

impl fmt::Debug for VoxelLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VoxelLookup")
            .field(&self.0.as_ref().map(|_| "<source>"))
            .finish()
    }
}

/// Sparse label map, handy for tests and for small label overlays.
#[derive(Debug, Clone, Default)]
pub struct SparseLabels {
    labels: HashMap<Coordinate, u64>,
}

impl SparseLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: Coordinate, label: u64) {
        self.labels.insert(position, label);
    }
}

impl VoxelSource for SparseLabels {
    fn voxel_at(&self, position: Coordinate) -> Option<u64> {
        self.labels.get(&position).copied()
    }
}
