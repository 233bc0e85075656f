use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::debug;

/// One row of a function's pc-to-line table: the instruction at `offset`
/// begins a statement on `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: usize,
    pub line: u32,
}

/// Debug metadata of a compiled function, as exposed by the host VM.
pub trait FunctionLayout {
    /// Source file the function was compiled from, `None` without debug info.
    fn file_name(&self) -> Option<&str>;

    /// Number of instruction slots the breakpoint bitmap has to cover.
    fn instruction_count(&self) -> usize;

    /// Statement starts in ascending offset order.
    fn line_table(&self) -> &[LineEntry];

    /// Line of the statement that contains `offset`.
    fn line_at(&self, offset: usize) -> Option<u32> {
        let table = self.line_table();
        let idx = table.partition_point(|entry| entry.offset <= offset);
        idx.checked_sub(1).map(|i| table[i].line)
    }
}

/// Per-function breakpoint cache.
///
/// Owned by the host's function metadata, filled in only by
/// [`BreakpointTable::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionBreakpoints {
    bitmap: Vec<u8>,
    version: u64,
    last_line: Option<u32>,
}

impl FunctionBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Line of the most recent statement-boundary check in this function.
    pub fn last_line(&self) -> Option<u32> {
        self.last_line
    }

    pub(crate) fn record_line(&mut self, line: u32) {
        self.last_line = Some(line);
    }

    #[inline(always)]
    pub fn is_set(&self, offset: usize) -> bool {
        self.bitmap
            .get(offset / 8)
            .is_some_and(|byte| byte & (1 << (offset % 8)) != 0)
    }

    pub fn has_any(&self) -> bool {
        self.bitmap.iter().any(|&byte| byte != 0)
    }

    fn set(&mut self, offset: usize) {
        self.bitmap[offset / 8] |= 1 << (offset % 8);
    }
}

/// Outcome of [`BreakpointTable::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The cached bitmap was current and left untouched.
    Hit,
    /// The bitmap was recomputed from the table.
    Rebuilt,
}

/// Breakpoint lines per source file, versioned by a dirty counter.
///
/// Every mutation bumps the counter; a [`FunctionBreakpoints`] cache is valid
/// only while its stored version equals [`BreakpointTable::current_version`].
#[derive(Debug)]
pub struct BreakpointTable {
    files: FxHashMap<String, BTreeSet<u32>>,
    version: u64,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointTable {
    pub fn new() -> Self {
        // Fresh caches start at version 0 and are therefore always stale.
        Self {
            files: FxHashMap::default(),
            version: 1,
        }
    }

    pub fn current_version(&self) -> u64 {
        self.version
    }

    /// Replaces the line set for `file`.
    pub fn set_breakpoints(
        &mut self,
        file: &str,
        lines: impl IntoIterator<Item = u32>,
    ) -> &BTreeSet<u32> {
        let lines: BTreeSet<u32> = lines.into_iter().collect();
        self.version += 1;
        debug!(file, ?lines, version = self.version, "Breakpoints replaced");

        if lines.is_empty() {
            self.files.remove(file);
            static EMPTY: BTreeSet<u32> = BTreeSet::new();
            return &EMPTY;
        }
        self.files.insert(file.to_string(), lines);
        &self.files[file]
    }

    pub fn breakpoints_for(&self, file: &str) -> Option<&BTreeSet<u32>> {
        self.files.get(file)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.version += 1;
        debug!(version = self.version, "Breakpoints cleared");
    }

    /// Brings `cache` up to date with this table.
    ///
    /// A cache whose version matches is returned as is. Otherwise every
    /// statement start whose line carries a breakpoint is marked and the
    /// version is stamped.
    pub fn refresh(&self, cache: &mut FunctionBreakpoints, layout: &dyn FunctionLayout) -> Refresh {
        if cache.version == self.version {
            return Refresh::Hit;
        }

        let count = layout.instruction_count();
        cache.bitmap.clear();
        cache.bitmap.resize(count.div_ceil(8), 0);

        let lines = layout
            .file_name()
            .and_then(|file| self.breakpoints_for(file));

        for entry in layout.line_table() {
            if entry.offset >= count {
                continue;
            }
            if lines.is_some_and(|lines| lines.contains(&entry.line)) {
                cache.set(entry.offset);
            }
        }

        cache.version = self.version;
        Refresh::Rebuilt
    }
}
