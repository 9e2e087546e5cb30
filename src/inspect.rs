use crate::classify::aggregate;
use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::heap::{HeapNode, HeapWalker};
use crate::liveness::Liveness;
use crate::memory::Memory;
use crate::pool::PoolWalker;
use crate::report::{Row, Unit};
use crate::symbols::{Frame, Symbols};

/// Entry point of the engine: binds a target description to its collaborators.
///
/// Every report is rebuilt from scratch out of `memory`; nothing is cached between calls, so one
/// inspector can be reused after the target moved on.
///
/// ```rust
/// use heapscope::{
///     DumpRequest, Inspector, LiveOwners, PointerWidth, Snapshot, SymbolTable, TargetConfig,
/// };
///
/// let target = TargetConfig::new(PointerWidth::Eight);
/// let memory = Snapshot::new();
/// let symbols = SymbolTable::new();
/// let liveness = LiveOwners::new();
///
/// let inspector = Inspector::new(&target, &memory, &symbols, &liveness).unwrap();
/// let report = inspector.dump(&DumpRequest::default());
/// assert_eq!(report.totals.count, 0);
/// ```
pub struct Inspector<'a, M: ?Sized, S: ?Sized, L: ?Sized> {
    pub(crate) target: &'a TargetConfig,
    pub(crate) memory: &'a M,
    pub(crate) symbols: &'a S,
    pub(crate) liveness: &'a L,
}

impl<'a, M, S, L> Inspector<'a, M, S, L>
where
    M: Memory + ?Sized,
    S: Symbols + ?Sized,
    L: Liveness + ?Sized,
{
    /// Fails with [`Error::MisconfiguredTarget`] if `target` does not validate.
    pub fn new(
        target: &'a TargetConfig,
        memory: &'a M,
        symbols: &'a S,
        liveness: &'a L,
    ) -> Result<Self> {
        target.validate()?;
        Ok(Self {
            target,
            memory,
            symbols,
            liveness,
        })
    }

    pub fn target(&self) -> &'a TargetConfig {
        self.target
    }

    /// Walks the heap regions.
    pub fn heap_nodes(&self) -> HeapWalker<'a, M> {
        HeapWalker::new(self.memory, self.target)
    }

    /// Walks the blocks of one pool; `None` if the pool is unknown or blocks carry no trailer.
    pub fn pool_blocks(&self, index: usize) -> Option<PoolWalker<'a, M>> {
        PoolWalker::new(self.memory, self.target, index)
    }

    pub(crate) fn collect_nodes(&self, diagnostics: &mut Vec<Error>) -> Vec<HeapNode> {
        let mut nodes = Vec::new();
        for item in self.heap_nodes() {
            match item {
                Ok(node) => nodes.push(node),
                Err(error) => diagnostics.push(error),
            }
        }
        nodes
    }

    /// Turns `(unit, bytes)` pairs into report rows, grouped by site when asked to.
    pub(crate) fn rows(&self, items: Vec<(Unit, u64)>, grouped: bool, simple: bool) -> Vec<Row> {
        if grouped {
            aggregate(items)
                .into_iter()
                .map(|group| self.row(group.representative, group.count, group.bytes, simple))
                .collect()
        } else {
            items
                .into_iter()
                .map(|(unit, bytes)| self.row(unit, 1, bytes, simple))
                .collect()
        }
    }

    pub(crate) fn row(&self, unit: Unit, count: usize, bytes: u64, simple: bool) -> Row {
        let alive = match unit.owner() {
            Some(owner) if self.target.tracking().records_owner() => {
                self.liveness.is_owner_alive(owner)
            }
            _ => true,
        };
        let callstack = unit
            .backtrace()
            .iter()
            .map(|pc| Frame {
                pc: *pc,
                location: (!simple).then(|| self.symbols.resolve_pc(*pc)),
            })
            .collect();

        Row {
            unit,
            count,
            bytes,
            alive,
            callstack,
        }
    }
}
