//! Streams and completion tokens.
//!
//! A [`Stream`] is an ordered submission queue bound to one engine. The CPU
//! build submits synchronously, so "submitted" and "completed" coincide; the
//! [`CompletionToken`] still records full dependency provenance so chained
//! submission keeps the same observable contract an asynchronous runtime
//! would have.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::Engine;
use crate::error::Result;

static TOKEN_IDS: AtomicU64 = AtomicU64::new(1);

/// Opaque completion handle carrying its dependency set.
#[derive(Debug, Clone)]
pub struct CompletionToken {
    id: u64,
    deps: Arc<[CompletionToken]>,
}

impl CompletionToken {
    pub(crate) fn new(deps: Vec<CompletionToken>) -> Self {
        Self { id: TOKEN_IDS.fetch_add(1, Ordering::Relaxed), deps: deps.into() }
    }

    /// A token with no prerequisites (already complete on a CPU stream).
    pub fn immediate() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dependencies(&self) -> &[CompletionToken] {
        &self.deps
    }

    /// Whether `other` is in this token's transitive dependency closure.
    pub fn depends_transitively_on(&self, other: &CompletionToken) -> bool {
        let mut stack: Vec<&CompletionToken> = self.deps.iter().collect();
        while let Some(token) = stack.pop() {
            if token.id == other.id {
                return true;
            }
            stack.extend(token.deps.iter());
        }
        false
    }
}

/// Ordered submission queue bound to one engine.
#[derive(Debug, Clone)]
pub struct Stream {
    engine: Engine,
}

impl Stream {
    pub fn new(engine: &Engine) -> Self {
        Self { engine: engine.clone() }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Mint a completion token for work just submitted after `deps`.
    pub fn chain(&self, deps: Vec<CompletionToken>) -> CompletionToken {
        CompletionToken::new(deps)
    }

    /// Submit a primitive. On the CPU build this runs it to completion.
    ///
    /// # Safety
    ///
    /// Same contract as [`Primitive::execute`]: every bound pointer must be
    /// valid for its descriptor for the duration of the call.
    pub unsafe fn submit(&self, primitive: &dyn crate::primitives::Primitive, args: &crate::args::ExecArgs) -> Result<()> {
        unsafe { primitive.execute(self, args) }
    }

    /// Submit after `deps` and return a token covering this submission.
    ///
    /// # Safety
    ///
    /// Same contract as [`Stream::submit`].
    pub unsafe fn submit_chained(
        &self,
        primitive: &dyn crate::primitives::Primitive,
        args: &crate::args::ExecArgs,
        deps: Vec<CompletionToken>,
    ) -> Result<CompletionToken> {
        unsafe { primitive.execute(self, args) }?;
        Ok(CompletionToken::new(deps))
    }

    /// Block until all submitted work completes. Synchronous on CPU.
    pub fn wait(&self) -> Result<()> {
        Ok(())
    }
}
