use std::collections::HashMap;
use std::fmt;

use futures_util::future::BoxFuture;

use crate::symbols::SymbolTable;
use crate::{CallbackResult, Result};

/// Where a breakpoint goes: a raw instruction address or a kernel symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Address(u64),
    Symbol(String),
}

impl Location {
    pub fn resolve(&self, symbols: &SymbolTable) -> Result<u64> {
        match self {
            Location::Address(address) => Ok(*address),
            Location::Symbol(name) => symbols.lookup(name),
        }
    }
}

impl From<u64> for Location {
    fn from(address: u64) -> Self {
        Location::Address(address)
    }
}

impl From<&str> for Location {
    fn from(name: &str) -> Self {
        Location::Symbol(name.to_string())
    }
}

impl From<String> for Location {
    fn from(name: String) -> Self {
        Location::Symbol(name)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Address(address) => write!(f, "{address:#x}"),
            Location::Symbol(name) => f.write_str(name),
        }
    }
}

/// Hit budget of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hits {
    Times(u32),
    Unbounded,
}

impl Hits {
    /// A budget of zero hits means the breakpoint never expires.
    pub fn times(n: u32) -> Self {
        if n == 0 {
            Hits::Unbounded
        } else {
            Hits::Times(n)
        }
    }
}

impl Default for Hits {
    fn default() -> Self {
        Hits::Times(1)
    }
}

/// Callback run when the target stops at a registered address.
///
/// It borrows the handle that owns the registry, so it may read registers, install
/// or remove breakpoints, and decide whether the run continues.
pub type BreakpointCallback<H> =
    Box<dyn for<'a> FnMut(&'a mut H) -> BoxFuture<'a, CallbackResult> + Send + Sync>;

/// Boxes a closure as a [`BreakpointCallback`].
///
/// ```ignore
/// breakpoint_callback(|gdb: &mut Debugger| async move {
///     let scause = gdb.read_register("scause").await?;
///     Ok(Control::Continue)
/// }.boxed())
/// ```
pub fn breakpoint_callback<H, F>(f: F) -> BreakpointCallback<H>
where
    F: for<'a> FnMut(&'a mut H) -> BoxFuture<'a, CallbackResult> + Send + Sync + 'static,
{
    Box::new(f)
}

pub struct BreakpointEntry<H> {
    callback: Option<BreakpointCallback<H>>,
    remaining: Hits,
    number: Option<u32>,
}

impl<H> BreakpointEntry<H> {
    pub fn remaining(&self) -> Hits {
        self.remaining
    }

    /// Breakpoint number the debugger assigned, when known.
    pub fn number(&self) -> Option<u32> {
        self.number
    }
}

#[derive(Debug)]
struct InFlight {
    address: u64,
    replaced: bool,
}

/// Address-keyed breakpoint table.
///
/// Each address holds at most one entry; installing again replaces the callback and
/// hit budget. A finite budget decreases by one per hit and the entry is dropped
/// when it reaches zero.
pub struct BreakpointRegistry<H> {
    entries: HashMap<u64, BreakpointEntry<H>>,
    in_flight: Option<InFlight>,
}

impl<H> Default for BreakpointRegistry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: None,
        }
    }
}

impl<H> BreakpointRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry at `address` and returns the one it replaced.
    pub fn insert(
        &mut self,
        address: u64,
        callback: Option<BreakpointCallback<H>>,
        hits: Hits,
        number: Option<u32>,
    ) -> Option<BreakpointEntry<H>> {
        self.mark_replaced(address);
        self.entries.insert(
            address,
            BreakpointEntry {
                callback,
                remaining: hits,
                number,
            },
        )
    }

    pub fn remove(&mut self, address: u64) -> Option<BreakpointEntry<H>> {
        self.mark_replaced(address);
        self.entries.remove(&address)
    }

    fn mark_replaced(&mut self, address: u64) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.address == address {
                in_flight.replaced = true;
            }
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn get(&self, address: u64) -> Option<&BreakpointEntry<H>> {
        self.entries.get(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.entries.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Starts handling a hit at `address`.
    ///
    /// Returns `None` for unknown addresses. Otherwise the entry's callback is lent
    /// out so it can run against the owner of this registry; hand it back through
    /// [`finish_dispatch`](Self::finish_dispatch).
    pub fn begin_dispatch(&mut self, address: u64) -> Option<Option<BreakpointCallback<H>>> {
        let entry = self.entries.get_mut(&address)?;
        self.in_flight = Some(InFlight {
            address,
            replaced: false,
        });
        Some(entry.callback.take())
    }

    /// Completes a hit started by [`begin_dispatch`](Self::begin_dispatch).
    ///
    /// Consumes one hit unless the callback itself replaced or removed the entry.
    /// Returns the removed entry when its budget ran out.
    pub fn finish_dispatch(
        &mut self,
        callback: Option<BreakpointCallback<H>>,
    ) -> Option<BreakpointEntry<H>> {
        let in_flight = self.in_flight.take()?;
        if in_flight.replaced {
            return None;
        }
        let entry = self.entries.get_mut(&in_flight.address)?;
        entry.callback = callback;
        match entry.remaining {
            Hits::Times(n) if n <= 1 => self.entries.remove(&in_flight.address),
            Hits::Times(n) => {
                entry.remaining = Hits::Times(n - 1);
                None
            }
            Hits::Unbounded => None,
        }
    }
}

impl<H> fmt::Debug for BreakpointRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for address in self.addresses() {
            if let Some(entry) = self.entries.get(&address) {
                map.entry(&format_args!("{address:#x}"), &entry.remaining);
            }
        }
        map.finish()
    }
}
