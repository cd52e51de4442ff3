//! Value cells — containers for resource attributes whose concrete value may
//! not be known until a provider call completes.
//!
//! A cell is an explicit state machine: `Pending` with registered
//! continuations, or `Settled` with an immutable result. `map` and `combine`
//! derive new cells without blocking; secrecy taints monotonically through
//! every derivation; provenance (the graph nodes whose outputs feed a cell)
//! rides along so the graph builder can recover implicit dependency edges.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::graph::NodeId;

/// Rejection payload. Cheap to clone so every downstream cell can carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellError {
    message: Arc<str>,
}

impl CellError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CellError {}

pub type CellResult<T> = Result<T, CellError>;

type Continuation<T> = Box<dyn FnOnce(&CellResult<T>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Settled(CellResult<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Deferred/resolvable holder for an attribute value.
pub struct Cell<T> {
    shared: Arc<Shared<T>>,
    secret: Arc<AtomicBool>,
    tainted_by: Vec<Arc<AtomicBool>>,
    deps: Vec<NodeId>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            secret: Arc::clone(&self.secret),
            tainted_by: self.tainted_by.clone(),
            deps: self.deps.clone(),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.shared.state.lock().expect("cell lock poisoned") {
            State::Pending(_) => "pending",
            State::Settled(Ok(_)) => "resolved",
            State::Settled(Err(_)) => "rejected",
        };
        f.debug_struct("Cell")
            .field("state", &state)
            .field("secret", &self.is_secret())
            .finish()
    }
}

/// Completion hook for a deferred cell. Settling twice is a no-op: once
/// settled, a cell is immutable.
pub struct CellResolver<T> {
    cell: Cell<T>,
}

impl<T: Clone + Send + 'static> CellResolver<T> {
    pub fn resolve(&self, value: T) {
        self.cell.settle(Ok(value));
    }

    pub fn reject(&self, error: CellError) {
        self.cell.settle(Err(error));
    }
}

impl<T: Clone + Send + 'static> Cell<T> {
    fn with_parts(
        state: State<T>,
        tainted_by: Vec<Arc<AtomicBool>>,
        deps: Vec<NodeId>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
            secret: Arc::new(AtomicBool::new(false)),
            tainted_by,
            deps,
        }
    }

    /// An already-resolved cell.
    pub fn of(value: T) -> Self {
        Self::with_parts(State::Settled(Ok(value)), Vec::new(), Vec::new())
    }

    /// An unresolved cell plus its completion hook.
    pub fn deferred() -> (Self, CellResolver<T>) {
        let cell = Self::with_parts(State::Pending(Vec::new()), Vec::new(), Vec::new());
        let resolver = CellResolver { cell: cell.clone() };
        (cell, resolver)
    }

    /// An unresolved cell whose value will originate from `node`'s outputs.
    pub(crate) fn pending_for(node: NodeId) -> Self {
        Self::with_parts(State::Pending(Vec::new()), Vec::new(), vec![node])
    }

    /// Settle the cell. A second settle is a no-op.
    pub(crate) fn settle(&self, result: CellResult<T>) {
        let waiters = {
            let mut state = self.shared.state.lock().expect("cell lock poisoned");
            match &mut *state {
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Settled(result.clone());
                    waiters
                }
                State::Settled(_) => return,
            }
        };
        for waiter in waiters {
            waiter(&result);
        }
    }

    /// Run `f` with the result: now if settled, otherwise once it settles.
    fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(&CellResult<T>) + Send + 'static,
    {
        let settled = {
            let mut state = self.shared.state.lock().expect("cell lock poisoned");
            match &mut *state {
                State::Pending(waiters) => {
                    waiters.push(Box::new(f));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        f(&settled);
    }

    /// Derive a cell that resolves to `f(value)`; rejection passes through.
    pub fn map<U, F>(&self, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let out = Cell::<U>::with_parts(
            State::Pending(Vec::new()),
            self.taint_chain(),
            self.deps.clone(),
        );
        let target = out.clone();
        self.subscribe(move |result| match result {
            Ok(value) => target.settle(Ok(f(value.clone()))),
            Err(e) => target.settle(Err(e.clone())),
        });
        out
    }

    /// Join cells into one that resolves to all values in input order.
    ///
    /// Resolution order of the inputs does not matter. If any input rejects,
    /// the joined cell rejects — once every input has settled — with the
    /// leftmost rejection in registration order.
    pub fn combine(cells: &[Cell<T>]) -> Cell<Vec<T>> {
        let mut taints = Vec::new();
        let mut deps = Vec::new();
        for cell in cells {
            for t in cell.taint_chain() {
                if !taints.iter().any(|x| Arc::ptr_eq(x, &t)) {
                    taints.push(t);
                }
            }
            for &d in &cell.deps {
                if !deps.contains(&d) {
                    deps.push(d);
                }
            }
        }

        let out = Cell::<Vec<T>>::with_parts(State::Pending(Vec::new()), taints, deps);
        if cells.is_empty() {
            out.settle(Ok(Vec::new()));
            return out;
        }

        let n = cells.len();
        let slots: Arc<Mutex<(Vec<Option<CellResult<T>>>, usize)>> =
            Arc::new(Mutex::new((vec![None; n], 0)));

        for (i, cell) in cells.iter().enumerate() {
            let slots = Arc::clone(&slots);
            let target = out.clone();
            cell.subscribe(move |result| {
                let finished = {
                    let mut guard = slots.lock().expect("combine lock poisoned");
                    guard.0[i] = Some(result.clone());
                    guard.1 += 1;
                    if guard.1 == n {
                        Some(std::mem::take(&mut guard.0))
                    } else {
                        None
                    }
                };
                if let Some(settled) = finished {
                    let mut values = Vec::with_capacity(n);
                    let mut first_error = None;
                    for slot in settled {
                        match slot {
                            Some(Ok(v)) => values.push(v),
                            Some(Err(e)) => {
                                if first_error.is_none() {
                                    first_error = Some(e);
                                }
                            }
                            None => unreachable!("combine slot settled without a result"),
                        }
                    }
                    match first_error {
                        Some(e) => target.settle(Err(e)),
                        None => target.settle(Ok(values)),
                    }
                }
            });
        }
        out
    }

    /// Non-blocking peek. `None` while pending.
    pub fn try_get(&self) -> Option<CellResult<T>> {
        match &*self.shared.state.lock().expect("cell lock poisoned") {
            State::Pending(_) => None,
            State::Settled(result) => Some(result.clone()),
        }
    }

    /// Await settlement.
    pub async fn wait(&self) -> CellResult<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.subscribe(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(CellError::new("value cell dropped while pending")))
    }
}

impl<T> Cell<T> {
    /// Taint this cell (and, transitively, everything derived from it).
    pub fn mark_secret(&self) {
        self.secret.store(true, Ordering::SeqCst);
    }

    /// Builder-style `mark_secret`.
    pub fn secret(self) -> Self {
        self.mark_secret();
        self
    }

    /// Secret when marked directly or when any ancestor cell is secret.
    pub fn is_secret(&self) -> bool {
        self.secret.load(Ordering::SeqCst)
            || self.tainted_by.iter().any(|t| t.load(Ordering::SeqCst))
    }

    fn taint_chain(&self) -> Vec<Arc<AtomicBool>> {
        let mut chain = self.tainted_by.clone();
        chain.push(Arc::clone(&self.secret));
        chain
    }

    pub fn is_settled(&self) -> bool {
        !matches!(
            &*self.shared.state.lock().expect("cell lock poisoned"),
            State::Pending(_)
        )
    }

    /// Graph nodes whose outputs feed this cell, in first-reference order.
    pub(crate) fn provenance(&self) -> &[NodeId] {
        &self.deps
    }
}

/// Resource attribute values are dynamically typed JSON.
pub type Input = Cell<serde_json::Value>;

/// A resolved literal input.
pub fn literal(value: impl Into<serde_json::Value>) -> Input {
    Cell::of(value.into())
}
