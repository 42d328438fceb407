//! The pass manager and the passes it drives.

mod constprop;
mod deadcode;
mod deadflags;
mod ravalidation;
mod redundant;
mod regalloc;
mod validation;

pub use constprop::ConstProp;
pub use deadcode::DeadCodeElimination;
pub use deadflags::DeadFlagStoreElimination;
pub use ravalidation::validate_register_allocation;
pub use redundant::RedundantContextLoadElimination;
pub use regalloc::{RegAllocConfig, RegisterAllocationPass};
pub use validation::{compute_cfg, Cfg, CfgBlock, IrValidation};

use crate::emitter::IrEmitter;
use crate::regdata::RegisterAllocationData;

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("IR validation failed: {0}")]
    Validation(String),
    #[error("register allocation failed: {0}")]
    RegAlloc(String),
    #[error("RA validation failed: {0}")]
    RaValidation(String),
}

/// An IR-to-IR transformation or check.
pub trait Pass {
    fn name(&self) -> &'static str;
    /// Returns true if the pass changed the IR.
    fn run(&mut self, emitter: &mut IrEmitter) -> Result<bool, PassError>;
}

/// Ordered list of passes, with register allocation (and its validation)
/// slotted at the end when a backend needs it.
pub struct PassManager {
    passes: Vec<Box<dyn Pass + Send>>,
    regalloc: Option<RegisterAllocationPass>,
    validate_ra: bool,
    ra_data: Option<RegisterAllocationData>,
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager { passes: Vec::new(), regalloc: None, validate_ra: false, ra_data: None }
    }

    /// The standard optimization pipeline.
    pub fn with_default_passes() -> PassManager {
        let mut manager = PassManager::new();
        manager.add(Box::new(ConstProp::new()));
        manager.add(Box::new(RedundantContextLoadElimination::new()));
        manager.add(Box::new(DeadFlagStoreElimination::new()));
        manager.add(Box::new(DeadCodeElimination::new()));
        if cfg!(debug_assertions) {
            manager.add(Box::new(IrValidation::new()));
        }
        manager
    }

    pub fn add(&mut self, pass: Box<dyn Pass + Send>) {
        self.passes.push(pass);
    }

    /// Request register allocation (and, in debug builds, its validation)
    /// after the IR passes.
    pub fn insert_register_allocation_pass(&mut self, config: RegAllocConfig) {
        self.regalloc = Some(RegisterAllocationPass::new(config));
        self.validate_ra = cfg!(debug_assertions);
    }

    /// Force RA validation regardless of build profile.
    pub fn set_validate_ra(&mut self, validate: bool) {
        self.validate_ra = validate;
    }

    pub fn run(&mut self, emitter: &mut IrEmitter) -> Result<(), PassError> {
        for pass in &mut self.passes {
            let changed = pass.run(emitter)?;
            log::trace!("pass {}: changed={}", pass.name(), changed);
        }
        if let Some(regalloc) = &mut self.regalloc {
            let data = regalloc.run(emitter)?;
            if self.validate_ra {
                validate_register_allocation(emitter.data(), &data)?;
            }
            self.ra_data = Some(data);
        }
        Ok(())
    }

    /// Allocation results of the most recent `run`, when RA is enabled.
    pub fn ra_data(&self) -> Option<&RegisterAllocationData> {
        self.ra_data.as_ref()
    }

    pub fn take_ra_data(&mut self) -> Option<RegisterAllocationData> {
        self.ra_data.take()
    }
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager::new()
    }
}
