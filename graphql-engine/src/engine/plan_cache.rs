use std::num::NonZeroUsize;
use std::sync::Arc;

use http::HeaderMap;
use http::HeaderName;
use sha2::Digest;
use sha2::Sha256;

use crate::ast;
use crate::cache::DedupCache;
use crate::error::ConfigurationError;
use crate::error::ExecutionError;
use crate::error::PlanningErrors;
use crate::graphql::Request;
use crate::query_planner::Planner;
use crate::query_planner::QueryHash;
use crate::query_planner::QueryPlan;

/// Plans by fingerprint.
///
/// At most one plan is built at a time for a given fingerprint. Planning errors are shared with
/// the callers waiting for the same plan and are not cached.
#[derive(Clone)]
pub(crate) struct PlanCache {
    cache: DedupCache<QueryHash, Arc<QueryPlan>, PlanningErrors>,
    fingerprint_headers: Arc<Vec<HeaderName>>,
}

impl PlanCache {
    pub(crate) fn new(
        capacity: usize,
        fingerprint_headers: &[String],
    ) -> Result<Self, ConfigurationError> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or(ConfigurationError::InvalidPlanCacheCapacity)?;
        let fingerprint_headers = fingerprint_headers
            .iter()
            .map(|name| {
                HeaderName::try_from(name.as_str()).map_err(|e| {
                    ConfigurationError::Deserialization(format!(
                        "invalid fingerprint header '{name}': {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            cache: DedupCache::new(capacity),
            fingerprint_headers: Arc::new(fingerprint_headers),
        })
    }

    /// The cache key of a normalized request.
    ///
    /// Hashes the printed operation, the operation name, the schema and the configured
    /// request headers.
    pub(crate) fn fingerprint(
        &self,
        request: &Request,
        schema_hash: &QueryHash,
        headers: &HeaderMap,
    ) -> Result<QueryHash, ExecutionError> {
        let document = request.document();
        let operation_name = request.operation_name.as_deref();
        let operation = document.operation_by_name(operation_name).ok_or_else(|| {
            ExecutionError::UnknownOperation {
                name: operation_name.unwrap_or_default().to_string(),
            }
        })?;

        let mut hasher = Sha256::new();
        hasher.update(ast::print_operation(document, operation).as_bytes());
        hasher.update([0xFF]);
        hasher.update(operation_name.unwrap_or_default().as_bytes());
        hasher.update([0xFF]);
        hasher.update(&schema_hash.0);
        for name in self.fingerprint_headers.iter() {
            hasher.update([0xFF]);
            hasher.update(name.as_str().as_bytes());
            for value in headers.get_all(name) {
                hasher.update([0xFE]);
                hasher.update(value.as_bytes());
            }
        }
        Ok(QueryHash(hasher.finalize().to_vec()))
    }

    pub(crate) async fn get_or_plan(
        &self,
        planner: &Planner,
        request: &Request,
        fingerprint: QueryHash,
    ) -> Result<Arc<QueryPlan>, PlanningErrors> {
        self.cache
            .get_or_try_insert_with(fingerprint, || async {
                tracing::debug!("plan cache miss");
                let plan = planner.plan(request.document(), request.operation_name.as_deref());
                if let Err(errors) = &plan {
                    tracing::error!("{errors}");
                }
                plan.map(Arc::new)
            })
            .await
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}
