//! Exception policy table.
//!
//! One entry per CPU exception vector (0-31) saying how the dispatcher treats
//! it, plus occurrence counters. An entry with no mode, or a disabled entry,
//! is treated as fatal.

use super::{BREAKPOINT, DEBUG, DOUBLE_FAULT, EXCEPTION_COUNT, MACHINE_CHECK, NMI, PAGE_FAULT};
use core::sync::atomic::{AtomicU8, Ordering};
use kestrel_common::{ExceptionMode, IrqError};

/// Policy and counters for one exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Configured mode; `None` means unset.
    pub mode: Option<ExceptionMode>,
    /// Disabled entries behave as unset.
    pub enabled: bool,
    /// Locked entries refuse changes.
    pub locked: bool,
    /// Times the vector was raised.
    pub count: u64,
    /// Times a `recover` handler succeeded.
    pub recovered: u64,
    /// Tick of the most recent occurrence.
    pub last_tick: u64,
}

impl PolicyEntry {
    const UNSET: Self = Self {
        mode: None,
        enabled: true,
        locked: false,
        count: 0,
        recovered: 0,
        last_tick: 0,
    };

    /// The mode the dispatcher acts on.
    pub fn effective_mode(&self) -> ExceptionMode {
        match self.mode {
            Some(mode) if self.enabled => mode,
            _ => ExceptionMode::Fatal,
        }
    }
}

/// Policies for vectors 0-31.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: [PolicyEntry; EXCEPTION_COUNT],
}

impl PolicyTable {
    /// Creates the boot-time defaults.
    ///
    /// Debug, breakpoint and NMI are logged. Page fault and machine check are
    /// fatal. Double fault is fatal and locked. Everything else is unset.
    pub fn new() -> Self {
        let mut entries = [PolicyEntry::UNSET; EXCEPTION_COUNT];
        for vector in [DEBUG, BREAKPOINT, NMI] {
            entries[vector as usize].mode = Some(ExceptionMode::Log);
        }
        for vector in [PAGE_FAULT, MACHINE_CHECK, DOUBLE_FAULT] {
            entries[vector as usize].mode = Some(ExceptionMode::Fatal);
        }
        entries[DOUBLE_FAULT as usize].locked = true;
        Self { entries }
    }

    fn entry_mut(&mut self, vector: u8) -> Result<&mut PolicyEntry, IrqError> {
        let entry = self
            .entries
            .get_mut(vector as usize)
            .ok_or(IrqError::NotAnException)?;
        if entry.locked {
            return Err(IrqError::PolicyLocked);
        }
        Ok(entry)
    }

    /// Sets the mode for an exception vector.
    pub fn set_mode(&mut self, vector: u8, mode: ExceptionMode) -> Result<(), IrqError> {
        self.entry_mut(vector)?.mode = Some(mode);
        Ok(())
    }

    /// Enables or disables an entry without forgetting its mode.
    pub fn set_enabled(&mut self, vector: u8, enabled: bool) -> Result<(), IrqError> {
        self.entry_mut(vector)?.enabled = enabled;
        Ok(())
    }

    /// Returns the entry for `vector`, or `None` above 31.
    pub fn get(&self, vector: u8) -> Option<&PolicyEntry> {
        self.entries.get(vector as usize)
    }

    /// The mode the dispatcher acts on for `vector`.
    pub fn effective_mode(&self, vector: u8) -> ExceptionMode {
        self.get(vector)
            .map_or(ExceptionMode::Fatal, PolicyEntry::effective_mode)
    }

    /// Counts an occurrence of `vector` at `tick`.
    pub fn record(&mut self, vector: u8, tick: u64) {
        if let Some(entry) = self.entries.get_mut(vector as usize) {
            entry.count += 1;
            entry.last_tick = tick;
        }
    }

    /// Counts a successful recovery of `vector`.
    pub fn record_recovery(&mut self, vector: u8) {
        if let Some(entry) = self.entries.get_mut(vector as usize) {
            entry.recovered += 1;
        }
    }

    /// Clears every counter, keeping modes.
    pub fn clear_counters(&mut self) {
        for entry in &mut self.entries {
            entry.count = 0;
            entry.recovered = 0;
            entry.last_tick = 0;
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

const UNSET: u8 = 0;
const IGNORE: u8 = 1;
const LOG: u8 = 2;
const RECOVER: u8 = 3;
const FATAL: u8 = 4;

/// Lock-free copy of each vector's effective mode.
///
/// The dispatcher reads this instead of the [`PolicyTable`] so that an NMI
/// or a fault raised while the kernel lock is held can still be ignored or
/// logged. Writers update it under the kernel lock after changing the table.
pub(crate) struct ModeMirror {
    modes: [AtomicU8; EXCEPTION_COUNT],
}

impl ModeMirror {
    pub(crate) fn new(table: &PolicyTable) -> Self {
        let mirror = Self {
            modes: core::array::from_fn(|_| AtomicU8::new(UNSET)),
        };
        for vector in 0..EXCEPTION_COUNT as u8 {
            mirror.sync(table, vector);
        }
        mirror
    }

    /// Copies `vector`'s entry out of `table`.
    pub(crate) fn sync(&self, table: &PolicyTable, vector: u8) {
        let Some(entry) = table.get(vector) else {
            return;
        };
        let code = match entry.mode {
            Some(_) if !entry.enabled => UNSET,
            None => UNSET,
            Some(ExceptionMode::Ignore) => IGNORE,
            Some(ExceptionMode::Log) => LOG,
            Some(ExceptionMode::Recover) => RECOVER,
            Some(ExceptionMode::Fatal) => FATAL,
        };
        self.modes[vector as usize].store(code, Ordering::Release);
    }

    /// The effective mode for `vector`, and whether it was configured
    /// rather than falling back to fatal.
    pub(crate) fn load(&self, vector: u8) -> (ExceptionMode, bool) {
        let code = self
            .modes
            .get(vector as usize)
            .map_or(UNSET, |mode| mode.load(Ordering::Acquire));
        match code {
            IGNORE => (ExceptionMode::Ignore, true),
            LOG => (ExceptionMode::Log, true),
            RECOVER => (ExceptionMode::Recover, true),
            FATAL => (ExceptionMode::Fatal, true),
            _ => (ExceptionMode::Fatal, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let table = PolicyTable::new();
        assert_eq!(table.effective_mode(BREAKPOINT), ExceptionMode::Log);
        assert_eq!(table.effective_mode(NMI), ExceptionMode::Log);
        assert_eq!(table.effective_mode(PAGE_FAULT), ExceptionMode::Fatal);
        assert_eq!(table.effective_mode(MACHINE_CHECK), ExceptionMode::Fatal);
        assert_eq!(table.get(0).unwrap().mode, None);
        assert_eq!(table.effective_mode(0), ExceptionMode::Fatal);
    }

    #[test]
    fn double_fault_is_locked() {
        let mut table = PolicyTable::new();
        assert_eq!(
            table.set_mode(DOUBLE_FAULT, ExceptionMode::Ignore),
            Err(IrqError::PolicyLocked)
        );
        assert_eq!(table.set_enabled(DOUBLE_FAULT, false), Err(IrqError::PolicyLocked));
        assert_eq!(table.effective_mode(DOUBLE_FAULT), ExceptionMode::Fatal);
    }

    #[test]
    fn only_exception_vectors_have_policies() {
        let mut table = PolicyTable::new();
        assert_eq!(table.set_mode(32, ExceptionMode::Log), Err(IrqError::NotAnException));
        assert!(table.get(32).is_none());
    }

    #[test]
    fn disabled_entries_act_as_unset() {
        let mut table = PolicyTable::new();
        table.set_mode(PAGE_FAULT, ExceptionMode::Log).unwrap();
        table.set_enabled(PAGE_FAULT, false).unwrap();
        assert_eq!(table.effective_mode(PAGE_FAULT), ExceptionMode::Fatal);
        table.set_enabled(PAGE_FAULT, true).unwrap();
        assert_eq!(table.effective_mode(PAGE_FAULT), ExceptionMode::Log);
    }

    #[test]
    fn mirror_follows_the_table() {
        let mut table = PolicyTable::new();
        let mirror = ModeMirror::new(&table);
        assert_eq!(mirror.load(NMI), (ExceptionMode::Log, true));
        assert_eq!(mirror.load(PAGE_FAULT), (ExceptionMode::Fatal, true));
        assert_eq!(mirror.load(0), (ExceptionMode::Fatal, false));
        assert_eq!(mirror.load(40), (ExceptionMode::Fatal, false));

        table.set_mode(PAGE_FAULT, ExceptionMode::Recover).unwrap();
        mirror.sync(&table, PAGE_FAULT);
        assert_eq!(mirror.load(PAGE_FAULT), (ExceptionMode::Recover, true));

        table.set_enabled(PAGE_FAULT, false).unwrap();
        mirror.sync(&table, PAGE_FAULT);
        assert_eq!(mirror.load(PAGE_FAULT), (ExceptionMode::Fatal, false));
    }

    #[test]
    fn counters() {
        let mut table = PolicyTable::new();
        table.record(PAGE_FAULT, 7);
        table.record(PAGE_FAULT, 9);
        table.record_recovery(PAGE_FAULT);
        let entry = table.get(PAGE_FAULT).unwrap();
        assert_eq!((entry.count, entry.recovered, entry.last_tick), (2, 1, 9));
        table.clear_counters();
        assert_eq!(table.get(PAGE_FAULT).unwrap().count, 0);
    }
}
