//! Request-scoped batching of upstream calls.
//!
//! Every mounted field resolved during one client request attaches its upstream query to the
//! [`UpstreamLoad`] of its endpoint. The first attachment to ask for the outcome runs the load:
//! all documents attached so far are merged and sent as one request, and every attachment
//! receives the same result. Attaching to a load that has already started opens a new one.

use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::{sync::OnceCell, time::Instant};
use tracing::debug;

use crate::{
    error::ResolveError,
    merge::{self, AliasTree},
    query::{self, QueryDocument},
    schema::{OperationKind, type_to_string},
    upstream::{Upstream, UpstreamRequest, UpstreamResponse},
};

/// Settings every upstream call of one client request shares.
#[derive(Clone, Debug, Default)]
pub struct UpstreamOptions {
    pub headers: Vec<(String, String)>,
    pub deadline: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Executing,
    Completed,
}

/// What one executed load produced.
#[derive(Debug)]
pub struct LoadResult {
    /// The merged query text that was sent.
    pub query: String,
    pub variables: Map<String, Value>,
    pub response: UpstreamResponse,
    /// One alias tree per attachment, indexed like the attachments.
    pub aliases: Vec<AliasTree>,
}

type Outcome = Result<Arc<LoadResult>, ResolveError>;

struct Pending {
    state: LoadState,
    documents: Vec<QueryDocument>,
    variables: Map<String, Value>,
    // variable name -> (declared type, value)
    signatures: HashMap<String, (String, Option<Value>)>,
}

pub struct UpstreamLoad {
    upstream: Arc<Upstream>,
    kind: OperationKind,
    options: UpstreamOptions,
    pending: Mutex<Pending>,
    outcome: OnceCell<Outcome>,
}

impl UpstreamLoad {
    fn new(upstream: Arc<Upstream>, kind: OperationKind, options: UpstreamOptions) -> Self {
        UpstreamLoad {
            upstream,
            kind,
            options,
            pending: Mutex::new(Pending {
                state: LoadState::Pending,
                documents: Vec::new(),
                variables: Map::new(),
                signatures: HashMap::new(),
            }),
            outcome: OnceCell::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        match self.pending.lock() {
            Ok(pending) => pending.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.upstream.id
    }

    /// Adds `document` to the load, returning its index, or `None` once the load has started.
    fn add(&self, mut document: QueryDocument, mut variables: Map<String, Value>) -> Option<usize> {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.state != LoadState::Pending {
            return None;
        }

        let declared: Vec<(String, String)> = query::variable_definitions(&document)
            .into_iter()
            .map(|v| (v.name.clone(), type_to_string(&v.var_type)))
            .collect();

        for (name, var_type) in declared {
            let value = variables.remove(&name);
            let signature = (var_type, value.clone());

            let target = match pending.signatures.get(&name) {
                None => name.clone(),
                Some(existing) if *existing == signature => name.clone(),
                Some(_) => {
                    let renamed = (1..)
                        .map(|n| format!("{}_{}", name, n))
                        .find(|candidate| match pending.signatures.get(candidate) {
                            None => true,
                            Some(existing) => *existing == signature,
                        })
                        .unwrap_or_else(|| name.clone());
                    query::rename_variable(&mut document, &name, &renamed);
                    renamed
                }
            };

            if let Some(value) = value {
                pending.variables.insert(target.clone(), value);
            }
            pending.signatures.insert(target, signature);
        }

        pending.documents.push(document);
        Some(pending.documents.len() - 1)
    }

    /// Runs the load if nobody has yet, then returns its shared outcome.
    pub async fn outcome(&self) -> Outcome {
        self.outcome.get_or_init(|| self.execute()).await.clone()
    }

    async fn execute(&self) -> Outcome {
        let endpoint = self.upstream.id.clone();
        let (documents, variables) = {
            let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if pending.state != LoadState::Pending {
                // the task that started this load went away before finishing it
                return Err(ResolveError::Cancelled { endpoint });
            }
            pending.state = LoadState::Executing;
            (
                std::mem::take(&mut pending.documents),
                std::mem::take(&mut pending.variables),
            )
        };

        let outcome = self.send(documents, variables).await;

        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.state = LoadState::Completed;
        outcome.map(Arc::new)
    }

    async fn send(
        &self,
        documents: Vec<QueryDocument>,
        variables: Map<String, Value>,
    ) -> Result<LoadResult, ResolveError> {
        let endpoint = self.upstream.id.clone();
        let merged = merge::merge(documents);
        let document = merged
            .documents
            .into_iter()
            .find(|d| d.kind == self.kind)
            .ok_or_else(|| {
                ResolveError::InvalidQuery(format!("no {} to send to `{}`", self.kind, endpoint))
            })?;
        let query = document.document.to_string();

        debug!(endpoint = %endpoint, query = %query, "executing upstream load");

        let call = self.upstream.client.execute(UpstreamRequest {
            query: query.clone(),
            variables: variables.clone(),
            headers: self.options.headers.clone(),
        });
        let response = match self.options.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| ResolveError::Timeout {
                    endpoint: endpoint.clone(),
                })?,
            None => call.await,
        }
        .map_err(|e| ResolveError::Transport {
            endpoint: endpoint.clone(),
            message: e.0,
        })?;

        Ok(LoadResult {
            query,
            variables,
            response,
            aliases: merged.aliases,
        })
    }
}

/// One document's membership in a load.
pub struct Attachment {
    load: Arc<UpstreamLoad>,
    index: usize,
}

impl Attachment {
    pub fn load(&self) -> &Arc<UpstreamLoad> {
        &self.load
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the load's outcome.
    ///
    /// Yields once first so sibling fields resolved concurrently get to attach before the
    /// load is sent.
    pub async fn outcome(&self) -> Outcome {
        tokio::task::yield_now().await;
        self.load.outcome().await
    }
}

/// Owns the loads of one client request, keyed by endpoint and operation kind.
pub struct LoadCoordinator {
    options: UpstreamOptions,
    loads: Mutex<HashMap<(String, OperationKind), Arc<UpstreamLoad>>>,
}

impl LoadCoordinator {
    pub fn new(options: UpstreamOptions) -> Self {
        LoadCoordinator {
            options,
            loads: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    pub fn attach(
        &self,
        upstream: &Arc<Upstream>,
        kind: OperationKind,
        document: QueryDocument,
        variables: Map<String, Value>,
    ) -> Attachment {
        let mut loads = self.loads.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (upstream.id.clone(), kind);

        if let Some(load) = loads.get(&key) {
            if let Some(index) = load.add(document.clone(), variables.clone()) {
                return Attachment {
                    load: load.clone(),
                    index,
                };
            }
        }

        let load = Arc::new(UpstreamLoad::new(upstream.clone(), kind, self.options.clone()));
        // a fresh load is pending, so this always succeeds
        let index = load.add(document, variables).unwrap_or_default();
        loads.insert(key, load.clone());
        Attachment { load, index }
    }
}
