// Emitter — builds kernels and records them in the primitive registry
//
// One Emitter exists per compiled program. It owns the engine context, the
// primitive registry and the workspace manager, and is dropped as a unit
// when the program is; handles it returns stay valid until then.
//
// Every operation follows the same three steps, split across two entry
// points:
//
//   resolve   desc → resolved kernel descriptor (validation, layouts,
//             algorithm, workspace size). Fails before touching the registry.
//   reserve   fix the slot layout: memory slots, then the kernel slot whose
//             dependency list references them.
//   install   populate the memory slots named by the dependency list and put
//             the kernel into its slot.
//
//   build_<op>(...)            resolve + reserve + install, returns the handle
//   rebuild_<op>(desc, handle) resolve + install into an existing reservation
//
// Because both paths share `install`, a reservation followed by a rebuild
// ends in exactly the registry state a one-phase build produces.

pub mod batchnorm;
pub mod conv;
pub mod eltwise;
pub mod pool;
pub mod reorder;
pub mod rnn;

use log::{debug, trace};
use shrew_core::{DType, Shape};

use crate::engine::Engine;
use crate::error::{BackendError, Error, Result};
use crate::memory::{self, MemoryDesc, MemoryFormat};
use crate::primitive::{
    Dependency, DependencyList, Kernel, Primitive, PrimitiveHandle, WorkspaceHandle,
};
use crate::registry::{PrimitiveRegistry, RegistryStats};
use crate::workspace::{WorkspaceBuffer, WorkspaceManager, WorkspaceStats};

/// Attach the kernel name to an engine diagnostic.
pub(crate) fn construct<T>(primitive: &'static str, resolved: std::result::Result<T, BackendError>) -> Result<T> {
    resolved.map_err(|source| {
        debug!("emitter: could not create {}: {}", primitive, source);
        Error::construction(primitive, source)
    })
}

/// Builds kernels for one compiled program.
#[derive(Debug)]
pub struct Emitter {
    engine: Engine,
    registry: PrimitiveRegistry,
    workspaces: WorkspaceManager,
}

impl Emitter {
    pub fn new(engine: Engine) -> Result<Self> {
        let workspaces = WorkspaceManager::new(engine.config().workspace_alignment)?;
        Ok(Emitter {
            engine,
            registry: PrimitiveRegistry::new(),
            workspaces,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &PrimitiveRegistry {
        &self.registry
    }

    /// Built primitives in handle order.
    pub fn primitives(&self) -> impl Iterator<Item = (PrimitiveHandle, &Primitive)> {
        self.registry.iter()
    }

    pub fn get(&self, handle: PrimitiveHandle) -> Result<&Primitive> {
        self.registry.get(handle)
    }

    /// The kernel at `handle`; memory slots are an error.
    pub fn get_kernel(&self, handle: PrimitiveHandle) -> Result<&Kernel> {
        self.registry.get(handle)?.as_kernel().ok_or_else(|| {
            Error::msg(format!("primitive {} is a memory primitive", handle))
        })
    }

    pub fn get_dependencies(&self, handle: PrimitiveHandle) -> Result<&DependencyList> {
        self.registry.dependencies(handle)
    }

    pub fn workspace(&self, handle: WorkspaceHandle) -> Result<&WorkspaceBuffer> {
        self.workspaces.get(handle)
    }

    /// Raw workspace pointers indexed by workspace handle.
    pub fn get_workspace_buffers(&mut self) -> Vec<*mut u8> {
        self.workspaces.buffer_ptrs()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn workspace_stats(&self) -> WorkspaceStats {
        self.workspaces.stats()
    }

    pub fn insert_primitive(&mut self, primitive: Primitive) -> PrimitiveHandle {
        self.registry.insert(primitive)
    }

    /// Allocate a workspace buffer of `size` bytes.
    pub fn insert_workspace(&mut self, size: usize) -> Result<WorkspaceHandle> {
        self.workspaces.insert(size)
    }

    // Memory descriptors and primitives

    pub fn build_memory_descriptor(
        &self,
        shape: &Shape,
        dtype: DType,
        format: MemoryFormat,
    ) -> Result<MemoryDesc> {
        memory::build_descriptor(shape, dtype, format)
    }

    pub fn build_blocked_memory_descriptor(
        &self,
        shape: &Shape,
        strides: &[usize],
        dtype: DType,
    ) -> Result<MemoryDesc> {
        memory::build_blocked_descriptor(shape, strides, dtype)
    }

    fn check_materializable(desc: &MemoryDesc) -> Result<()> {
        if desc.is_materializable() {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "cannot materialize a buffer with layout {}",
                desc.format()
            )))
        }
    }

    /// Append a memory primitive for `desc`.
    pub fn build_memory_primitive(&mut self, desc: &MemoryDesc) -> Result<PrimitiveHandle> {
        Self::check_materializable(desc)?;
        Ok(self.registry.insert(Primitive::Memory(desc.clone())))
    }

    /// Put a memory primitive for `desc` into an existing slot.
    pub fn rebuild_memory_primitive(&mut self, desc: &MemoryDesc, handle: PrimitiveHandle) -> Result<()> {
        Self::check_materializable(desc)?;
        self.registry.rebuild(handle, Primitive::Memory(desc.clone()))
    }

    // Reservations

    /// Reserve `count` slots for a kernel whose dependencies are the
    /// `count - 1` slots before it (plus a workspace buffer when
    /// `new_workspace` is set). Returns the kernel's handle.
    pub fn reserve_primitive_space(&mut self, count: usize, new_workspace: bool) -> Result<PrimitiveHandle> {
        let handle = self.registry.reserve_slots(count, new_workspace)?;
        trace!(
            "emitter: reserved kernel {} over {} slots (workspace: {})",
            handle,
            count,
            new_workspace
        );
        Ok(handle)
    }

    /// Reserve the convolution forward layout: src, weights, [bias], dst, kernel.
    pub fn convolution_forward_init(&mut self, with_bias: bool) -> Result<PrimitiveHandle> {
        self.reserve_primitive_space(if with_bias { 5 } else { 4 }, false)
    }

    // Install helpers

    /// The dependency list of `handle`, checked for the kernel's arity.
    fn install_deps(&self, handle: PrimitiveHandle, expected: usize) -> Result<DependencyList> {
        let deps = self.registry.dependencies(handle)?;
        if deps.len() != expected {
            return Err(Error::DependencyArity {
                handle,
                expected,
                found: deps.len(),
            });
        }
        Ok(deps.clone())
    }

    fn dep_primitive(deps: &DependencyList, handle: PrimitiveHandle, index: usize) -> Result<PrimitiveHandle> {
        deps.primitive(index).ok_or(Error::DependencyKind {
            handle,
            index,
            expected: "primitive",
        })
    }

    /// Populate the memory slot at position `index` of the kernel's
    /// dependency list.
    fn place_memory(
        &mut self,
        deps: &DependencyList,
        handle: PrimitiveHandle,
        index: usize,
        desc: &MemoryDesc,
    ) -> Result<PrimitiveHandle> {
        let slot = Self::dep_primitive(deps, handle, index)?;
        self.rebuild_memory_primitive(desc, slot)?;
        Ok(slot)
    }

    /// Allocate a fresh workspace buffer for position `index` of the
    /// kernel's dependency list.
    fn place_workspace(&mut self, handle: PrimitiveHandle, index: usize, size: usize) -> Result<WorkspaceHandle> {
        let ws = self.workspaces.insert(size)?;
        self.registry
            .patch_workspace(handle, index, Dependency::Workspace(ws))?;
        Ok(ws)
    }

    fn place_kernel(&mut self, handle: PrimitiveHandle, kernel: Kernel) -> Result<()> {
        let name = kernel.desc.name();
        self.registry.rebuild(handle, Primitive::Kernel(kernel))?;
        debug!(
            "emitter: built {} at {} ({} dependencies)",
            name,
            handle,
            self.registry.dependencies(handle).map(|d| d.len()).unwrap_or(0)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::DataType;

    fn emitter() -> Emitter {
        Emitter::new(Engine::with_config(EngineConfig::default())).unwrap()
    }

    #[test]
    fn test_memory_primitive_rejects_any() {
        let mut em = emitter();
        let any = MemoryDesc::any(vec![2, 2], DataType::F32).unwrap();
        assert!(matches!(
            em.build_memory_primitive(&any),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(em.registry().is_empty());
    }

    #[test]
    fn test_convolution_forward_init() {
        let mut em = emitter();
        let h = em.convolution_forward_init(true).unwrap();
        assert_eq!(h.index(), 4);
        assert_eq!(em.get_dependencies(h).unwrap().indices(), vec![0, 1, 2, 3]);
        let h = em.convolution_forward_init(false).unwrap();
        assert_eq!(h.index(), 8);
        assert_eq!(em.get_dependencies(h).unwrap().indices(), vec![5, 6, 7]);
    }

    #[test]
    fn test_install_arity_mismatch() {
        let mut em = emitter();
        let h = em.reserve_primitive_space(2, false).unwrap();
        assert!(matches!(
            em.install_deps(h, 3),
            Err(Error::DependencyArity {
                expected: 3,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_get_kernel_on_memory_slot() {
        let mut em = emitter();
        let desc = MemoryDesc::new(vec![4], DataType::F32, MemoryFormat::X).unwrap();
        let h = em.build_memory_primitive(&desc).unwrap();
        assert!(em.get_kernel(h).is_err());
        assert_eq!(em.get(h).unwrap().as_memory(), Some(&desc));
    }
}
