use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::FlattenNode;
use super::PlanNode;
use super::QueryPlan;
use super::fetch::FetchNode;
use super::log;
use crate::error::ResolveError;
use crate::graphql::Error;
use crate::graphql::Response;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::query_planner::FETCH_SPAN_NAME;
use crate::query_planner::FLATTEN_SPAN_NAME;
use crate::query_planner::PARALLEL_SPAN_NAME;
use crate::query_planner::SEQUENCE_SPAN_NAME;
use crate::resolver::FetchHooks;
use crate::sources::DataSources;
use crate::spec::Schema;

/// Everything a plan run reads but never changes.
pub(crate) struct ExecutionParameters<'a> {
    pub(crate) sources: &'a DataSources,
    pub(crate) schema: &'a Arc<Schema>,
    pub(crate) variables: &'a Object,
    pub(crate) headers: &'a HeaderMap,
    pub(crate) hooks: &'a dyn FetchHooks,
    pub(crate) cancellation: &'a CancellationToken,
}

/// Data and field errors produced by one plan node.
#[derive(Default)]
struct NodeOutput {
    data: Value,
    errors: Vec<Error>,
}

impl NodeOutput {
    fn absorb(&mut self, other: NodeOutput) {
        self.data.deep_merge(other.data);
        self.errors.extend(other.errors);
    }
}

impl QueryPlan {
    /// Runs the plan and shapes the merged data after the operation.
    ///
    /// Field errors end up in the response. Only fatal errors are returned as `Err`.
    pub(crate) async fn execute(
        &self,
        parameters: &ExecutionParameters<'_>,
    ) -> Result<Response, ResolveError> {
        log::trace_query_plan(&self.root);

        let start = Value::Object(Object::new());
        let NodeOutput { data, mut errors } = self
            .root
            .run(parameters, &Path::empty(), &start)
            .await?;

        let mut merged = start;
        merged.deep_merge(data);
        let data = self.query.format_response(Some(merged), &mut errors);

        Ok(Response::builder().data(data).errors(errors).build())
    }
}

impl PlanNode {
    fn run<'a>(
        &'a self,
        parameters: &'a ExecutionParameters<'a>,
        path: &'a Path,
        parent: &'a Value,
    ) -> BoxFuture<'a, Result<NodeOutput, ResolveError>> {
        Box::pin(async move {
            match self {
                PlanNode::Sequence { nodes } => {
                    run_sequence(nodes, parameters, path, parent)
                        .instrument(tracing::info_span!(
                            SEQUENCE_SPAN_NAME,
                            "otel.kind" = "INTERNAL"
                        ))
                        .await
                }
                PlanNode::Parallel { nodes } => {
                    run_parallel(nodes, parameters, path, parent)
                        .instrument(tracing::info_span!(
                            PARALLEL_SPAN_NAME,
                            "otel.kind" = "INTERNAL"
                        ))
                        .await
                }
                PlanNode::Flatten(FlattenNode { path: relative, node }) => {
                    let path = path.join(relative);
                    let span = tracing::info_span!(
                        FLATTEN_SPAN_NAME,
                        "graphql.path" = %path,
                        "otel.kind" = "INTERNAL"
                    );
                    node.run(parameters, &path, parent).instrument(span).await
                }
                PlanNode::Fetch(fetch) => run_fetch(fetch, parameters, path, parent).await,
            }
        })
    }
}

/// Each node sees the data merged by the nodes before it.
async fn run_sequence(
    nodes: &[PlanNode],
    parameters: &ExecutionParameters<'_>,
    path: &Path,
    parent: &Value,
) -> Result<NodeOutput, ResolveError> {
    let mut output = NodeOutput {
        data: parent.clone(),
        errors: Vec::new(),
    };
    for node in nodes {
        let step = node.run(parameters, path, &output.data).in_current_span().await?;
        output.absorb(step);
    }
    Ok(output)
}

/// Nodes run concurrently on the same parent data and are merged in completion order.
async fn run_parallel(
    nodes: &[PlanNode],
    parameters: &ExecutionParameters<'_>,
    path: &Path,
    parent: &Value,
) -> Result<NodeOutput, ResolveError> {
    let mut pending: FuturesUnordered<_> = nodes
        .iter()
        .map(|node| node.run(parameters, path, parent).in_current_span())
        .collect();

    let mut output = NodeOutput::default();
    while let Some(branch) = pending.next().await {
        output.absorb(branch?);
    }
    Ok(output)
}

async fn run_fetch(
    fetch: &FetchNode,
    parameters: &ExecutionParameters<'_>,
    path: &Path,
    parent: &Value,
) -> Result<NodeOutput, ResolveError> {
    let span = tracing::info_span!(
        FETCH_SPAN_NAME,
        "otel.kind" = "INTERNAL",
        "data_source.id" = fetch.source_id.as_str()
    );
    let (data, errors) = fetch
        .fetch_node(parameters, parent, path)
        .instrument(span)
        .await?;
    Ok(NodeOutput { data, errors })
}
