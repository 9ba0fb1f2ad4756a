//! Provenance tracking for bijector computations.
//!
//! Every value produced by a bijector while tracking is enabled is wrapped
//! in a [`FlowTensor`] carrying a trace record: the tensor it was computed
//! from, the producing bijector, the direction of the computation, and the
//! log-determinant of the Jacobian that came out of it. Traces let a later
//! `inverse(forward(x))` return the original `x` untouched and let
//! log-Jacobian queries walk the recorded chain instead of recomputing.
//!
//! Tensor identity is `Arc` pointer identity: clones of a `FlowTensor`
//! refer to the same underlying value and compare equal under
//! [`FlowTensor::same_value`].

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayD};

use crate::error::{FlowError, Result};
use crate::ops::sum_rightmost;

/// Unique identity of a constructed bijector instance.
pub type BijectorId = u64;

static NEXT_BIJECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh bijector identity. Called once per constructed instance.
pub fn next_bijector_id() -> BijectorId {
    NEXT_BIJECTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which call produced a tracked tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The tensor is the output of the bijector's forward call.
    Forward,
    /// The tensor is the reconstruction produced by the bijector's inverse
    /// call.
    Inverse,
}

/// Provenance record attached to a tracked tensor.
///
/// `log_det` is always stored in the forward sense of the producing
/// bijector: log|det d(forward output)/d(forward input)|, at the producing
/// bijector's event granularity.
pub struct Trace {
    parent: FlowTensor,
    bijector: BijectorId,
    direction: Direction,
    log_det: Option<ArrayD<f64>>,
    context: Option<Array1<f64>>,
}

/// A value tensor, optionally annotated with provenance.
///
/// Plain tensors (inputs from the caller, or any value produced while
/// tracking is disabled) carry no trace. Traces are immutable once attached;
/// a new computation produces a new tensor rather than re-tagging.
#[derive(Clone)]
pub struct FlowTensor {
    data: Arc<ArrayD<f64>>,
    trace: Option<Arc<Trace>>,
}

impl FlowTensor {
    /// Wrap a plain value with no provenance.
    pub fn new(value: ArrayD<f64>) -> Self {
        FlowTensor {
            data: Arc::new(value),
            trace: None,
        }
    }

    /// Attach a trace to a freshly computed value.
    ///
    /// `parent` is the tensor the value was computed from: the forward input
    /// for [`Direction::Forward`], the inverse argument for
    /// [`Direction::Inverse`]. A cached `log_det` must be shaped like a
    /// leading-axes reduction of the value; anything else is a graph
    /// consistency violation.
    pub fn register(
        parent: &FlowTensor,
        value: ArrayD<f64>,
        bijector: BijectorId,
        direction: Direction,
        log_det: Option<ArrayD<f64>>,
        context: Option<&Array1<f64>>,
    ) -> Result<FlowTensor> {
        if let Some(ldj) = &log_det {
            if ldj.ndim() > value.ndim() || ldj.shape() != &value.shape()[..ldj.ndim()] {
                return Err(FlowError::graph(format!(
                    "cached log-Jacobian shape {:?} is not a leading reduction of value shape {:?}",
                    ldj.shape(),
                    value.shape()
                )));
            }
        }
        Ok(FlowTensor {
            data: Arc::new(value),
            trace: Some(Arc::new(Trace {
                parent: parent.clone(),
                bijector,
                direction,
                log_det,
                context: context.cloned(),
            })),
        })
    }

    /// Re-wrap an existing value under a new trace, preserving value
    /// identity (the data is shared, not copied). Used by composites to
    /// attribute a whole pipeline to themselves as a single hop.
    pub fn retag(
        parent: &FlowTensor,
        value: &FlowTensor,
        bijector: BijectorId,
        direction: Direction,
        log_det: Option<ArrayD<f64>>,
        context: Option<&Array1<f64>>,
    ) -> Result<FlowTensor> {
        if let Some(ldj) = &log_det {
            if ldj.ndim() > value.array().ndim()
                || ldj.shape() != &value.array().shape()[..ldj.ndim()]
            {
                return Err(FlowError::graph(format!(
                    "cached log-Jacobian shape {:?} is not a leading reduction of value shape {:?}",
                    ldj.shape(),
                    value.array().shape()
                )));
            }
        }
        Ok(FlowTensor {
            data: Arc::clone(&value.data),
            trace: Some(Arc::new(Trace {
                parent: parent.clone(),
                bijector,
                direction,
                log_det,
                context: context.cloned(),
            })),
        })
    }

    /// The underlying value.
    pub fn array(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Pointer identity of the underlying value. Clones compare equal;
    /// recomputed values do not.
    pub fn same_value(&self, other: &FlowTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn is_tracked(&self) -> bool {
        self.trace.is_some()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.trace.as_ref().map(|t| t.direction)
    }

    pub fn from_forward(&self) -> bool {
        self.direction() == Some(Direction::Forward)
    }

    pub fn from_inverse(&self) -> bool {
        self.direction() == Some(Direction::Inverse)
    }

    /// Identity of the bijector that produced this tensor.
    pub fn producer(&self) -> Option<BijectorId> {
        self.trace.as_ref().map(|t| t.bijector)
    }

    /// The tensor this one was computed from.
    pub fn parent(&self) -> Option<FlowTensor> {
        self.trace.as_ref().map(|t| t.parent.clone())
    }

    /// Cached forward-sense log|det J| of the producing computation.
    pub fn cached_log_det(&self) -> Option<&ArrayD<f64>> {
        self.trace.as_ref().and_then(|t| t.log_det.as_ref())
    }

    /// Whether the producing computation used the given context.
    pub fn context_matches(&self, context: Option<&Array1<f64>>) -> bool {
        match &self.trace {
            Some(t) => t.context.as_ref() == context,
            None => context.is_none(),
        }
    }

    /// A copy of this tensor with its provenance dropped. Shares the value.
    pub fn detach(&self) -> FlowTensor {
        FlowTensor {
            data: Arc::clone(&self.data),
            trace: None,
        }
    }

    /// True iff `candidate` appears in this tensor's parent chain. A tensor
    /// is never its own ancestor. Terminates because traces can only
    /// reference tensors that existed before them.
    pub fn has_ancestor(&self, candidate: &FlowTensor) -> bool {
        let mut cur = self.trace.clone();
        while let Some(trace) = cur {
            if trace.parent.same_value(candidate) {
                return true;
            }
            cur = trace.parent.trace.clone();
        }
        false
    }

    /// Walk the parent chain to `ancestor`, accumulating
    /// log|det d(self)/d(ancestor)| from the cached per-hop terms.
    ///
    /// Each hop contributes its stored forward-sense log|det J| with a plus
    /// sign when the hop tensor was produced by a forward call and a minus
    /// sign when produced by an inverse call (the chain rule applied to the
    /// inverse function swaps the sign). Hop terms are summed down to
    /// `batch_ndim` leading axes before accumulation so hops of different
    /// event granularity combine.
    ///
    /// Fails with a graph error if `ancestor` is not an ancestor or a hop
    /// on the path has no cached term.
    pub fn log_abs_det_to_ancestor(
        &self,
        ancestor: &FlowTensor,
        batch_ndim: usize,
    ) -> Result<ArrayD<f64>> {
        let mut total: Option<ArrayD<f64>> = None;
        let mut cur = self.clone();
        loop {
            let trace = cur.trace.clone().ok_or_else(|| {
                FlowError::graph("tensor is not an ancestor of the queried value")
            })?;
            let ldj = trace.log_det.as_ref().ok_or_else(|| {
                FlowError::graph("a hop on the cached chain has no log-Jacobian")
            })?;
            let reduce = ldj.ndim().saturating_sub(batch_ndim);
            let mut term = sum_rightmost(ldj, reduce);
            if trace.direction == Direction::Inverse {
                term.mapv_inplace(|v| -v);
            }
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
            if trace.parent.same_value(ancestor) {
                return Ok(total.expect("at least one hop accumulated"));
            }
            cur = trace.parent.clone();
        }
    }
}

impl fmt::Debug for FlowTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTensor")
            .field("shape", &self.data.shape())
            .field("tracked", &self.is_tracked())
            .field("direction", &self.direction())
            .finish()
    }
}

impl From<ArrayD<f64>> for FlowTensor {
    fn from(value: ArrayD<f64>) -> Self {
        FlowTensor::new(value)
    }
}

impl From<Array1<f64>> for FlowTensor {
    fn from(value: Array1<f64>) -> Self {
        FlowTensor::new(value.into_dyn())
    }
}

impl From<Array2<f64>> for FlowTensor {
    fn from(value: Array2<f64>) -> Self {
        FlowTensor::new(value.into_dyn())
    }
}

thread_local! {
    static RECORD_FLOW: Cell<bool> = const { Cell::new(true) };
    static REQUIRES_LOG_DET: Cell<bool> = const { Cell::new(true) };
}

/// Whether bijector calls currently attach provenance to their results.
pub fn is_tracking_enabled() -> bool {
    RECORD_FLOW.with(|c| c.get())
}

/// Whether composite pipelines accumulate log-Jacobians eagerly.
pub fn requires_log_det() -> bool {
    REQUIRES_LOG_DET.with(|c| c.get())
}

/// Scope guard restoring the tracking flag on drop, including during panic
/// unwind. Nesting guards gives stack discipline.
#[must_use = "the previous flag value is restored when the guard drops"]
pub struct TrackingGuard {
    prev: bool,
}

/// Enable or disable provenance tracking for the current scope.
pub fn set_tracking(enabled: bool) -> TrackingGuard {
    let prev = RECORD_FLOW.with(|c| c.replace(enabled));
    TrackingGuard { prev }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        RECORD_FLOW.with(|c| c.set(self.prev));
    }
}

/// Scope guard for the log-Jacobian accumulation flag.
#[must_use = "the previous flag value is restored when the guard drops"]
pub struct LogDetGuard {
    prev: bool,
}

/// Enable or disable eager log-Jacobian accumulation for the current scope.
pub fn set_requires_log_det(enabled: bool) -> LogDetGuard {
    let prev = REQUIRES_LOG_DET.with(|c| c.replace(enabled));
    LogDetGuard { prev }
}

impl Drop for LogDetGuard {
    fn drop(&mut self) {
        REQUIRES_LOG_DET.with(|c| c.set(self.prev));
    }
}
