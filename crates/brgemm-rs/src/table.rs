use crate::error::BrgemmResult;
use crate::executor::BrgemmKernelExecutor;
use crate::metadata::MetadataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(usize);

impl ExecutorId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct TableEntry {
    source: Box<dyn MetadataSource>,
    executor: BrgemmKernelExecutor,
}

/// Executors of one lowered program, each paired with the node it serves.
#[derive(Default)]
pub struct KernelExecutorTable {
    entries: Vec<TableEntry>,
}

impl KernelExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source: Box<dyn MetadataSource>,
        executor: BrgemmKernelExecutor,
    ) -> ExecutorId {
        let id = ExecutorId(self.entries.len());
        self.entries.push(TableEntry { source, executor });
        id
    }

    /// Refreshes every executor from its node and compiles what changed.
    pub fn update_state(&mut self) -> BrgemmResult<()> {
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            entry.executor.update_by_metadata(entry.source.as_ref())?;
            tracing::trace!(
                executor = idx,
                state = ?entry.executor.state(),
                "updated brgemm executor"
            );
        }
        Ok(())
    }

    /// Replaces the node an executor reads its metadata from.
    pub fn set_source(&mut self, id: ExecutorId, source: Box<dyn MetadataSource>) -> Option<()> {
        let entry = self.entries.get_mut(id.0)?;
        entry.source = source;
        Some(())
    }

    pub fn get(&self, id: ExecutorId) -> Option<&BrgemmKernelExecutor> {
        self.entries.get(id.0).map(|entry| &entry.executor)
    }

    pub fn get_mut(&mut self, id: ExecutorId) -> Option<&mut BrgemmKernelExecutor> {
        self.entries.get_mut(id.0).map(|entry| &mut entry.executor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ExecutorId> + '_ {
        (0..self.entries.len()).map(ExecutorId)
    }
}
