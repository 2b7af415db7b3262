//! Dynamic-graph reverse-mode autograd. A `Variable` wraps a value tensor
//! plus its creator function node; `backward` walks the DAG once, highest
//! generation first, accumulating gradients into every reachable leaf.

pub mod ops;

use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use std::cell::{Cell, Ref, RefCell};
use std::collections::{BinaryHeap, HashSet};
use std::rc::{Rc, Weak};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether operator calls currently record graph nodes.
pub fn grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// Runs `f` without recording any graph nodes. Used for frozen-reference
/// scoring and the GRPO old-policy pass.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            GRAD_ENABLED.with(|g| g.set(self.0));
        }
    }
    let _restore = Restore(GRAD_ENABLED.with(|g| g.replace(false)));
    f()
}

/// A differentiable operation: forward already ran (the kernel produced the
/// output value); `backward` maps the output gradient to one gradient per
/// input, in input order. `None` marks a statically non-differentiable
/// input; the engine accepts and ignores those.
pub trait Function {
    fn name(&self) -> &'static str;
    fn backward(&self, inputs: &[Tensor], grad_out: &Tensor) -> MzResult<Vec<Option<Tensor>>>;
}

/// Graph node remembering the operation, its input variables and a weak
/// link to the output it produced.
pub struct FunctionNode {
    op: Box<dyn Function>,
    inputs: Vec<Variable>,
    generation: u32,
    output: RefCell<Weak<RefCell<VarCell>>>,
    consumed: Cell<bool>,
}

struct VarCell {
    value: Tensor,
    grad: Option<Tensor>,
    creator: Option<Rc<FunctionNode>>,
    generation: u32,
    requires_grad: bool,
    name: Option<String>,
}

/// Autograd node handle. Clones share the underlying cell.
#[derive(Clone)]
pub struct Variable {
    inner: Rc<RefCell<VarCell>>,
}

impl Variable {
    /// Plain data leaf; gradients are not tracked through it.
    pub fn new(value: Tensor) -> Self {
        Self::leaf(value, false)
    }

    /// Trainable leaf.
    pub fn with_grad(value: Tensor) -> Self {
        Self::leaf(value, true)
    }

    fn leaf(value: Tensor, requires_grad: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(VarCell {
                value,
                grad: None,
                creator: None,
                generation: 0,
                requires_grad,
                name: None,
            })),
        }
    }

    pub fn value(&self) -> Ref<'_, Tensor> {
        Ref::map(self.inner.borrow(), |c| &c.value)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().value.shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.inner.borrow().value.ndim()
    }

    pub fn item(&self) -> MzResult<f32> {
        self.inner.borrow().value.item()
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.inner.borrow().grad.clone()
    }

    pub fn clear_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    /// Rescales the stored gradient in place; no-op when no grad exists.
    pub fn scale_grad(&self, factor: f32) {
        if let Some(g) = &mut self.inner.borrow_mut().grad {
            g.scale_inplace(factor);
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.borrow().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.inner.borrow_mut().requires_grad = requires_grad;
    }

    pub fn name(&self) -> Option<String> {
        self.inner.borrow().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.borrow_mut().name = Some(name.into());
    }

    pub fn generation(&self) -> u32 {
        self.inner.borrow().generation
    }

    /// Replaces the stored value. The new tensor must keep the shape so any
    /// existing gradient stays consistent.
    pub fn set_value(&self, value: Tensor) -> MzResult<()> {
        let mut cell = self.inner.borrow_mut();
        if cell.value.shape() != value.shape() {
            return Err(MzError::shapes("set_value", cell.value.shape(), value.shape()));
        }
        cell.value = value;
        Ok(())
    }

    /// In-place mutation of the stored value (optimizer updates).
    pub fn update_value(&self, f: impl FnOnce(&mut Tensor)) {
        f(&mut self.inner.borrow_mut().value);
    }

    pub(crate) fn creator(&self) -> Option<Rc<FunctionNode>> {
        self.inner.borrow().creator.clone()
    }

    /// Shares the same underlying cell (same storage, same grad).
    pub fn same_as(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn accumulate_grad(&self, gx: Tensor) -> MzResult<()> {
        let mut cell = self.inner.borrow_mut();
        if gx.shape() != cell.value.shape() {
            return Err(MzError::shapes("grad_accumulate", cell.value.shape(), gx.shape()));
        }
        match &mut cell.grad {
            Some(g) => g.add_assign_t(&gx)?,
            None => cell.grad = Some(gx),
        }
        Ok(())
    }

    /// Reverse-mode pass seeded with ones (or a grad set beforehand).
    /// Visits each function node exactly once, highest generation first.
    /// A graph can be walked once; a second call is an error.
    pub fn backward(&self) -> MzResult<()> {
        let root = self
            .inner
            .borrow()
            .creator
            .clone()
            .ok_or(MzError::UninitializedGrad)?;
        if root.consumed.get() {
            return Err(MzError::GraphConsumed);
        }
        {
            let mut cell = self.inner.borrow_mut();
            if cell.grad.is_none() {
                cell.grad = Some(Tensor::ones(cell.value.shape()));
            }
        }

        let mut heap = BinaryHeap::new();
        let mut seen: HashSet<*const FunctionNode> = HashSet::new();
        let mut seq = 0u64;
        seen.insert(Rc::as_ptr(&root));
        heap.push(HeapEntry {
            generation: root.generation,
            seq,
            node: root,
        });

        while let Some(entry) = heap.pop() {
            let node = entry.node;
            node.consumed.set(true);

            let out_cell = node.output.borrow().upgrade().ok_or_else(|| {
                MzError::InvalidArgument(
                    "backward: an intermediate output was dropped before the pass".into(),
                )
            })?;
            let gy = out_cell
                .borrow()
                .grad
                .clone()
                .ok_or(MzError::UninitializedGrad)?;

            let input_values: Vec<Tensor> =
                node.inputs.iter().map(|v| v.value().clone()).collect();
            let gxs = node.op.backward(&input_values, &gy)?;
            if gxs.len() != node.inputs.len() {
                return Err(MzError::InvalidArgument(format!(
                    "{}: backward returned {} grads for {} inputs",
                    node.op.name(),
                    gxs.len(),
                    node.inputs.len()
                )));
            }

            for (input, gx) in node.inputs.iter().zip(gxs) {
                let Some(gx) = gx else { continue };
                if !input.requires_grad() {
                    continue;
                }
                input.accumulate_grad(gx)?;
                if let Some(creator) = input.creator() {
                    if seen.insert(Rc::as_ptr(&creator)) {
                        if creator.consumed.get() {
                            return Err(MzError::GraphConsumed);
                        }
                        seq += 1;
                        heap.push(HeapEntry {
                            generation: creator.generation,
                            seq,
                            node: creator,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops creator edges reachable from this variable so the runtime can
    /// reclaim intermediates; parameter grads survive for the optimizer.
    pub fn unchain_backward(&self) {
        let mut stack = vec![self.clone()];
        while let Some(v) = stack.pop() {
            let creator = v.inner.borrow_mut().creator.take();
            if let Some(node) = creator {
                for input in &node.inputs {
                    stack.push(input.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.borrow();
        f.debug_struct("Variable")
            .field("shape", &cell.value.shape())
            .field("requires_grad", &cell.requires_grad)
            .field("generation", &cell.generation)
            .field("name", &cell.name)
            .finish()
    }
}

/// Wires a freshly computed value into the graph. Skips node creation when
/// grad tracking is off or no input requires grad.
pub(crate) fn build_output(op: Box<dyn Function>, inputs: Vec<Variable>, value: Tensor) -> Variable {
    let track = grad_enabled() && inputs.iter().any(|v| v.requires_grad());
    if !track {
        return Variable::new(value);
    }
    let generation = inputs.iter().map(|v| v.generation()).max().unwrap_or(0);
    let node = Rc::new(FunctionNode {
        op,
        inputs,
        generation,
        output: RefCell::new(Weak::new()),
        consumed: Cell::new(false),
    });
    let out = Variable {
        inner: Rc::new(RefCell::new(VarCell {
            value,
            grad: None,
            creator: Some(node.clone()),
            generation: generation + 1,
            requires_grad: true,
            name: None,
        })),
    };
    *node.output.borrow_mut() = Rc::downgrade(&out.inner);
    out
}

struct HeapEntry {
    generation: u32,
    seq: u64,
    node: Rc<FunctionNode>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then(self.seq.cmp(&other.seq))
    }
}
