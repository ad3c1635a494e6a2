//! Graph orchestration: ties the fusion compiler, execution engine, and
//! autograd together behind `compile()`/`forward()`/`backward()`. A `Graph`
//! does not own tensors; it holds a root handle and the fusion plan derived
//! from it, referencing nodes through the `Context` arena the root's
//! `Tensor` already points at.

pub mod autograd;
pub mod debug;
pub mod exec;
pub mod fusion;
pub mod memory_planner;
pub mod verifier;

use std::collections::HashMap;

use tracing::instrument;

use crate::backend::{FusedKernelSpec, KernelKey};
use crate::errors::GPResult;
use crate::tensor::{Tensor, TensorId};

use autograd::Autograd;
use exec::ExecEngine;
use fusion::FusionCompiler;

/// A compiled computation graph rooted at a single output tensor.
pub struct Graph {
    root: Tensor,
    fusion: HashMap<TensorId, FusedKernelSpec>,
    compiled: bool,
}

impl Graph {
    pub fn new(root: Tensor) -> Self {
        Graph { root, fusion: HashMap::new(), compiled: false }
    }

    pub fn root(&self) -> &Tensor {
        &self.root
    }

    pub fn fused_kernel_count(&self) -> usize {
        self.fusion.len()
    }

    pub fn fused_kernel_keys(&self) -> Vec<KernelKey> {
        self.fusion.values().map(|spec| spec.key.clone()).collect()
    }

    /// Runs fusion analysis once and registers every resulting kernel with
    /// the backend. Calling this more than once returns `Ok(())` without
    /// re-running (fused kernel keys would otherwise collide on
    /// re-registration).
    #[instrument(skip(self), fields(root = self.root.id.0))]
    pub fn compile(&mut self) -> GPResult<()> {
        if self.compiled {
            return Ok(());
        }
        let ctx = self.root.ctx();
        let registered = FusionCompiler::compile(&ctx, self.root.id)?;
        self.fusion = registered.into_iter().collect();
        self.compiled = true;
        Ok(())
    }

    /// Materializes the root tensor, compiling first if needed.
    pub fn forward(&mut self) -> GPResult<Tensor> {
        self.compile()?;
        let ctx = self.root.ctx();
        ExecEngine::forward(&ctx, self.root.id, &self.fusion)?;
        Ok(self.root.clone())
    }

    /// Builds the gradient graph for `root` (which must be forward-evaluable
    /// as a scalar) and forward-evaluates every gradient tensor it produced.
    /// Returns the gradient with respect to `with_respect_to`, or `None` if
    /// that tensor did not participate in the computation.
    pub fn backward(&mut self, with_respect_to: &Tensor) -> GPResult<Option<Tensor>> {
        self.forward()?;
        Autograd::backward(&self.root)?;
        let Some(grad) = with_respect_to.grad() else {
            return Ok(None);
        };
        let ctx = self.root.ctx();
        ExecEngine::forward(&ctx, grad.id, &self.fusion)?;
        Ok(Some(grad))
    }

    pub fn describe(&self) -> String {
        debug::format_graph(&self.root.ctx())
    }
}
