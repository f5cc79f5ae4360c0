//! The interrupt vector table.
//!
//! A fixed array of 256 tagged slots. A slot is never removed, only
//! overwritten; an unbound slot is an explicit [`Binding::Unbound`].

use super::frame::InterruptContext;
use super::VECTOR_COUNT;
use alloc::sync::Arc;
use core::fmt;

/// Handlers implemented by the kernel itself.
///
/// Built-ins run with the kernel state locked, since they operate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Page-fault resolution through the address space.
    PageFault,
    /// Timer tick: preempt through the scheduler.
    Timer,
    /// Voluntary yield from task code.
    Yield,
    /// Block the running task until woken.
    Block,
    /// The running task returned from its entry point.
    TaskExit,
}

/// What a handler reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was handled; resume the (possibly updated) frame.
    Handled,
    /// The handler could not recover; a `recover` exception becomes fatal.
    NotRecovered,
}

/// A registered interrupt handler.
pub type Handler = Arc<dyn Fn(&mut InterruptContext<'_>) -> HandlerOutcome + Send + Sync>;

/// What a vector is bound to.
#[derive(Clone, Default)]
pub enum Binding {
    /// Nothing registered.
    #[default]
    Unbound,
    /// A kernel built-in.
    Builtin(Builtin),
    /// A handler registered through `register_handler`.
    User(Handler),
}

impl Binding {
    /// Returns true unless the slot is [`Binding::Unbound`].
    pub fn is_bound(&self) -> bool {
        !matches!(self, Binding::Unbound)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Unbound => write!(f, "Unbound"),
            Binding::Builtin(b) => write!(f, "Builtin({:?})", b),
            Binding::User(_) => write!(f, "User(..)"),
        }
    }
}

/// Lowest privilege level allowed to raise a vector with `int n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    /// Ring 0 only.
    #[default]
    Kernel,
    /// Any ring.
    User,
}

impl Privilege {
    /// Descriptor privilege level for the IDT gate.
    pub fn dpl(self) -> u8 {
        match self {
            Privilege::Kernel => 0,
            Privilege::User => 3,
        }
    }
}

/// One vector's entry.
#[derive(Debug, Clone, Default)]
pub struct HandlerSlot {
    /// The bound handler.
    pub binding: Binding,
    /// Minimum privilege for software-raised interrupts.
    pub privilege: Privilege,
}

/// The 256-entry vector table.
pub struct InterruptTable {
    slots: [HandlerSlot; VECTOR_COUNT],
}

impl InterruptTable {
    /// Creates a table with every vector unbound at kernel privilege.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| HandlerSlot::default()),
        }
    }

    /// Replaces the binding for `vector`, returning the previous one.
    pub fn bind(&mut self, vector: u8, binding: Binding) -> Binding {
        core::mem::replace(&mut self.slots[vector as usize].binding, binding)
    }

    /// Sets the minimum privilege for `vector`.
    pub fn set_privilege(&mut self, vector: u8, privilege: Privilege) {
        self.slots[vector as usize].privilege = privilege;
    }

    /// Returns the slot for `vector`.
    pub fn slot(&self, vector: u8) -> &HandlerSlot {
        &self.slots[vector as usize]
    }

    /// Iterates over `(vector, slot)` pairs that are bound.
    pub fn bound(&self) -> impl Iterator<Item = (u8, &HandlerSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.binding.is_bound())
            .map(|(v, slot)| (v as u8, slot))
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_replaced_not_removed() {
        let mut table = InterruptTable::new();
        assert_eq!(table.bound().count(), 0);

        let old = table.bind(32, Binding::Builtin(Builtin::Timer));
        assert!(!old.is_bound());

        let handler: Handler = Arc::new(|_: &mut InterruptContext<'_>| HandlerOutcome::Handled);
        let old = table.bind(32, Binding::User(handler));
        assert!(matches!(old, Binding::Builtin(Builtin::Timer)));
        assert!(matches!(table.slot(32).binding, Binding::User(_)));
        assert_eq!(table.bound().map(|(v, _)| v).collect::<alloc::vec::Vec<_>>(), [32]);
    }

    #[test]
    fn privilege_maps_to_dpl() {
        let mut table = InterruptTable::new();
        assert_eq!(table.slot(0x81).privilege.dpl(), 0);
        table.set_privilege(0x81, Privilege::User);
        assert_eq!(table.slot(0x81).privilege.dpl(), 3);
    }
}
