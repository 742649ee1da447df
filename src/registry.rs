//! Registered job entry points and the call wrapper.
//!
//! The wire protocol ships an entry tag plus a serialized argument rather
//! than code. Jobs are registered once, before the pool forks its first
//! child, so every worker inherits the same table across the fork.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Outcome of running an erased job inside a worker: the serialized result
/// or the user-side error rendered as text.
pub type JobOutcome = Result<Value, String>;

/// Identity-shaped pass-through wrapper applied around every user function
/// inside the child. Applications use it to install per-call
/// instrumentation; the wrapper receives a thunk that runs the job and
/// must return (or transform) its outcome.
pub type CallWrapper = Arc<dyn Fn(&mut dyn FnMut() -> JobOutcome) -> JobOutcome + Send + Sync>;

type ErasedJob = Arc<dyn Fn(Value) -> JobOutcome + Send + Sync>;

/// Typed token for a registered entry point. Carries the entry tag plus
/// the argument/result types the registration erased.
pub struct JobEntry<A, R> {
    name: &'static str,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> JobEntry<A, R> {
    /// The entry tag carried on the wire.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<A, R> Clone for JobEntry<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for JobEntry<A, R> {}

/// Table of registered entry points, shared with every worker child.
#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<&'static str, ErasedJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job function under a unique entry tag.
    ///
    /// Returns the typed token used to dispatch calls. Registration is
    /// startup-time wiring; a duplicate tag panics.
    pub fn register<A, R, F>(&mut self, name: &'static str, f: F) -> JobEntry<A, R>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let erased: ErasedJob = Arc::new(move |arg| {
            let arg: A = serde_json::from_value(arg)
                .map_err(|e| format!("bad argument for job `{}`: {}", name, e))?;
            let out = panic::catch_unwind(AssertUnwindSafe(|| f(arg))).map_err(panic_message)?;
            serde_json::to_value(out)
                .map_err(|e| format!("result serialization for job `{}`: {}", name, e))
        });
        let previous = self.entries.insert(name, erased);
        assert!(previous.is_none(), "job `{}` registered twice", name);
        JobEntry {
            name,
            _types: PhantomData,
        }
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run a registered entry on its serialized argument, through the
    /// wrapper when one is installed. Unknown tags and job panics come
    /// back as `Err`, never as an unwind.
    pub(crate) fn run(&self, entry: &str, arg: Value, wrapper: Option<&CallWrapper>) -> JobOutcome {
        let Some(job) = self.entries.get(entry) else {
            return Err(format!("unknown job entry `{}`", entry));
        };
        match wrapper {
            Some(wrap) => {
                let mut arg = Some(arg);
                let mut thunk = || job(arg.take().expect("job thunk invoked twice"));
                wrap(&mut thunk)
            }
            None => job(arg),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
