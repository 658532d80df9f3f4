use crate::graphql;
use crate::json_ext::Path;

/// Where in the response an upstream call happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    /// Response path the fetch is merged at.
    pub path: Path,
    pub source_id: String,
}

impl HookContext {
    pub(crate) fn new(path: Path, source_id: String) -> Self {
        Self { path, source_id }
    }
}

/// Observes upstream calls.
///
/// Hooks run synchronously on the resolving task: they must not block.
pub trait FetchHooks: Send + Sync {
    /// Called with the serialized upstream request before it is sent.
    fn on_before_fetch(&self, _context: &HookContext, _input: &[u8]) {}

    /// Called with the raw upstream response body.
    fn on_data(&self, _context: &HookContext, _output: &[u8]) {}

    /// Called with the errors of an upstream call, whether returned by the data source or
    /// produced by a failed call.
    fn on_error(&self, _context: &HookContext, _errors: &[graphql::Error]) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl FetchHooks for NoopHooks {}
