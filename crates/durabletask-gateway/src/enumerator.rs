//! Lazy instance enumeration over a paginated engine query.

use std::collections::HashSet;
use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ClientHandle;
use crate::engine::{InstancePage, InstanceQuery};
use crate::error::{GatewayError, Operation, Result, UpstreamError};
use crate::model::OrchestrationInstance;

/// Default number of instances requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

pub type InstanceStream = Pin<Box<dyn Stream<Item = Result<OrchestrationInstance>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Include input, output and failure details.
    pub fetch_payloads: bool,
    pub page_size: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            fetch_payloads: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Stream every instance in the handle's task hub.
///
/// Pages are fetched on demand and at most one page is held at a time.
/// Items the engine could not describe are skipped with a warning. The
/// cancellation token is checked before each page and raced against the
/// fetch itself.
pub fn list_instances(handle: ClientHandle, options: ListOptions, cancel: CancellationToken) -> InstanceStream {
    Box::pin(try_stream! {
        let task_hub = handle.task_hub_name().to_string();
        let mut continuation: Option<String> = None;
        let mut pages = 0usize;
        let mut visited = HashSet::new();

        loop {
            let query = InstanceQuery {
                page_size: options.page_size.max(1),
                continuation_token: continuation.clone(),
                fetch_inputs_and_outputs: options.fetch_payloads,
            };
            let page = fetch_page(&handle, &query, &cancel).await?;
            pages += 1;
            debug!(
                "ListInstances '{}': page {} with {} item(s)",
                task_hub,
                pages,
                page.instances.len()
            );

            for item in page.instances {
                let mapped = item.and_then(|descriptor| {
                    OrchestrationInstance::from_descriptor(descriptor, options.fetch_payloads)
                });
                match mapped {
                    Ok(instance) => yield instance,
                    Err(malformed) => warn!("Skipping instance in '{}': {}", task_hub, malformed),
                }
            }

            match page.continuation_token {
                None => break,
                Some(next) if !visited.insert(next.clone()) => {
                    Err::<(), _>(GatewayError::upstream(
                        Operation::ListInstances,
                        task_hub.clone(),
                        None,
                        UpstreamError::InvalidResponse(format!(
                            "continuation token '{next}' was already used"
                        )),
                    ))?;
                }
                Some(next) => continuation = Some(next),
            }
        }
    })
}

async fn fetch_page(
    handle: &ClientHandle,
    query: &InstanceQuery,
    cancel: &CancellationToken,
) -> Result<InstancePage> {
    let task_hub = handle.task_hub_name();
    if cancel.is_cancelled() {
        return Err(GatewayError::cancelled(Operation::ListInstances, task_hub));
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::cancelled(Operation::ListInstances, task_hub)),
        page = handle.engine().query_instances(query) => {
            page.map_err(|e| GatewayError::upstream(Operation::ListInstances, task_hub, None, e))
        }
    }
}

/// Drain a stream into a vector, stopping at the first error.
pub async fn collect_instances(stream: InstanceStream) -> Result<Vec<OrchestrationInstance>> {
    stream.try_collect().await
}
