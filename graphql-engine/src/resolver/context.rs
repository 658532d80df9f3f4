use std::sync::Arc;

use http::HeaderMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::FetchHooks;
use super::NoopHooks;
use crate::json_ext::Object;

const MAX_POOLED_CONTEXTS: usize = 64;

/// Per request resolution state.
pub struct Context {
    pub(crate) variables: Object,
    /// Headers forwarded to every upstream call.
    pub(crate) headers: HeaderMap,
    pub(crate) hooks: Arc<dyn FetchHooks>,
    pub(crate) cancellation: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            variables: Object::new(),
            headers: HeaderMap::new(),
            hooks: Arc::new(NoopHooks),
            cancellation: CancellationToken::new(),
        }
    }
}

impl Context {
    pub(crate) fn reset(&mut self) {
        self.variables.clear();
        self.headers.clear();
        self.hooks = Arc::new(NoopHooks);
        self.cancellation = CancellationToken::new();
    }
}

/// Recycles contexts between requests.
#[derive(Default)]
pub(crate) struct ContextPool {
    contexts: Mutex<Vec<Context>>,
}

impl ContextPool {
    pub(crate) fn get(&self) -> Context {
        self.contexts.lock().pop().unwrap_or_default()
    }

    pub(crate) fn put(&self, mut context: Context) {
        context.reset();
        let mut contexts = self.contexts.lock();
        if contexts.len() < MAX_POOLED_CONTEXTS {
            contexts.push(context);
        }
    }
}
