// Primitive Registry — append-only, handle-addressed store of primitives
//
// Every memory and kernel primitive the emitter constructs lands in one slot
// of a flat Vec. The slot index is the primitive's handle: stable for the
// life of the registry and never reused. Generated code captures handles
// during the first build pass, so nothing here may ever move or remove a slot.
//
// SLOT STATES:
//
//   Reserved { deps }             — position fixed, contents not known yet
//   Built { primitive, deps }     — populated
//
// `rebuild` moves Reserved|Built → Built, replacing only the primitive and
// keeping the dependency list. Two-phase construction reserves a contiguous
// range whose last slot is the kernel and whose earlier slots are the memory
// primitives it references, so pass one can emit code against indices that
// pass two fills in.

use std::fmt;

use log::trace;

use crate::error::{Error, Result};
use crate::primitive::{Dependency, DependencyList, Primitive, PrimitiveHandle};

#[derive(Debug)]
enum Slot {
    Reserved {
        deps: Option<DependencyList>,
    },
    Built {
        primitive: Primitive,
        deps: Option<DependencyList>,
    },
}

impl Slot {
    fn deps(&self) -> Option<&DependencyList> {
        match self {
            Slot::Reserved { deps } | Slot::Built { deps, .. } => deps.as_ref(),
        }
    }

    fn deps_mut(&mut self) -> &mut Option<DependencyList> {
        match self {
            Slot::Reserved { deps } | Slot::Built { deps, .. } => deps,
        }
    }
}

/// Counts of slot states in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub memory: usize,
    pub kernels: usize,
    pub reserved: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrimitiveRegistry: {} slots ({} memory, {} kernels, {} reserved)",
            self.memory + self.kernels + self.reserved,
            self.memory,
            self.kernels,
            self.reserved,
        )
    }
}

/// Append-only store of primitives and their dependency lists.
#[derive(Debug, Default)]
pub struct PrimitiveRegistry {
    slots: Vec<Slot>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, handle: PrimitiveHandle) -> Result<&Slot> {
        self.slots
            .get(handle.0)
            .ok_or(Error::UnknownHandle(handle))
    }

    fn slot_mut(&mut self, handle: PrimitiveHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.0)
            .ok_or(Error::UnknownHandle(handle))
    }

    /// Append a built primitive.
    pub fn insert(&mut self, primitive: Primitive) -> PrimitiveHandle {
        let handle = PrimitiveHandle(self.slots.len());
        trace!("registry: insert {} at {}", primitive.name(), handle);
        self.slots.push(Slot::Built {
            primitive,
            deps: None,
        });
        handle
    }

    /// Append `count` empty slots, returning the handle of the first.
    pub fn reserve(&mut self, count: usize) -> Result<PrimitiveHandle> {
        if count == 0 {
            return Err(Error::EmptyReservation);
        }
        let first = PrimitiveHandle(self.slots.len());
        self.slots
            .extend((0..count).map(|_| Slot::Reserved { deps: None }));
        trace!("registry: reserved {} slots from {}", count, first);
        Ok(first)
    }

    /// Reserve a kernel layout of `count` slots: `count - 1` memory slots
    /// followed by the kernel slot, whose dependency list references them in
    /// order, plus a pending workspace entry when `needs_workspace` is set.
    /// Returns the kernel's handle.
    pub fn reserve_slots(&mut self, count: usize, needs_workspace: bool) -> Result<PrimitiveHandle> {
        let first = self.reserve(count)?;
        let kernel = PrimitiveHandle(first.0 + count - 1);
        let mut deps: Vec<Dependency> = (first.0..kernel.0)
            .map(|i| Dependency::Primitive(PrimitiveHandle(i)))
            .collect();
        if needs_workspace {
            deps.push(Dependency::PendingWorkspace);
        }
        self.set_dependencies(kernel, DependencyList::new(deps))?;
        Ok(kernel)
    }

    /// Record the dependency list of a slot.
    pub fn set_dependencies(&mut self, handle: PrimitiveHandle, deps: DependencyList) -> Result<()> {
        *self.slot_mut(handle)?.deps_mut() = Some(deps);
        Ok(())
    }

    /// Replace one entry of an existing dependency list. Only workspace
    /// positions may change; primitive entries are fixed once recorded.
    pub fn patch_workspace(
        &mut self,
        handle: PrimitiveHandle,
        index: usize,
        dep: Dependency,
    ) -> Result<()> {
        let deps = self
            .slot_mut(handle)?
            .deps_mut()
            .as_mut()
            .ok_or(Error::MissingDependencies(handle))?;
        match (deps.get(index), dep) {
            (
                Some(Dependency::Workspace(_) | Dependency::PendingWorkspace),
                Dependency::Workspace(_),
            ) => {
                deps.set(index, dep);
                Ok(())
            }
            _ => Err(Error::DependencyKind {
                handle,
                index,
                expected: "workspace",
            }),
        }
    }

    /// The primitive in a built slot.
    pub fn get(&self, handle: PrimitiveHandle) -> Result<&Primitive> {
        match self.slot(handle)? {
            Slot::Built { primitive, .. } => Ok(primitive),
            Slot::Reserved { .. } => Err(Error::NotBuilt(handle)),
        }
    }

    pub fn is_built(&self, handle: PrimitiveHandle) -> bool {
        matches!(self.slots.get(handle.0), Some(Slot::Built { .. }))
    }

    /// The dependency list of a slot. Querying a slot that never received
    /// one is a programming error.
    pub fn dependencies(&self, handle: PrimitiveHandle) -> Result<&DependencyList> {
        self.slot(handle)?
            .deps()
            .ok_or(Error::MissingDependencies(handle))
    }

    /// Populate or replace the primitive at an issued handle. The handle and
    /// its dependency list are untouched.
    pub fn rebuild(&mut self, handle: PrimitiveHandle, primitive: Primitive) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        let deps = slot.deps_mut().take();
        trace!("registry: rebuild {} as {}", handle, primitive.name());
        *slot = Slot::Built { primitive, deps };
        Ok(())
    }

    /// Built primitives in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (PrimitiveHandle, &Primitive)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Built { primitive, .. } => Some((PrimitiveHandle(i), primitive)),
            Slot::Reserved { .. } => None,
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for slot in &self.slots {
            match slot {
                Slot::Reserved { .. } => stats.reserved += 1,
                Slot::Built {
                    primitive: Primitive::Memory(_),
                    ..
                } => stats.memory += 1,
                Slot::Built {
                    primitive: Primitive::Kernel(_),
                    ..
                } => stats.kernels += 1,
            }
        }
        stats
    }
}
