//! Demo server: an in-memory `list` resource with WebSocket push.
//!
//! ```text
//! curl -XPOST localhost:8080/lists -d '{"id":"1","name":"groceries"}' \
//!      -H 'content-type: application/json'
//! websocat ws://localhost:8080/events
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tidewire_core::{ApiError, Assignation, AssignationType, Entity, Identity, ModelRegistry};
use tidewire_server::service::{
    Context, CreateProcessor, DeleteProcessor, InfoProcessor, PatchProcessor,
    RetrieveManyProcessor, RetrieveProcessor, UpdateProcessor,
};
use tidewire_server::{
    build_dispatch_pipeline, Dispatcher, NetworkConfig, NetworkModule, Processor,
    ProcessorRegistry, PushConfig, PushServer, ServerConfig,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Tidewire demo server", long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "TIDEWIRE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "TIDEWIRE_PORT", default_value_t = 8080)]
    port: u16,

    /// Reject every write with 423
    #[arg(long, env = "TIDEWIRE_READ_ONLY")]
    read_only: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "TIDEWIRE_LOG_JSON")]
    log_json: bool,
}

// ---------------------------------------------------------------------------
// The `list` resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TodoList {
    id: String,
    name: String,
    #[serde(default)]
    items: Vec<String>,
}

fn list_identity() -> Identity {
    Identity::new("list", "lists")
}

impl Entity for TodoList {
    fn identity(&self) -> Identity {
        list_identity()
    }

    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::validation("name must not be empty", "lists"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ListStore {
    lists: RwLock<BTreeMap<String, TodoList>>,
}

impl ListStore {
    fn not_found(id: &str) -> anyhow::Error {
        ApiError::not_found(format!("list '{id}' does not exist"), "lists").into()
    }

    fn object_id(ctx: &Context) -> Result<String> {
        ctx.request()
            .object_id
            .clone()
            .ok_or_else(|| ApiError::bad_request("missing list id", "lists").into())
    }

    fn input(ctx: &Context) -> Result<TodoList> {
        ctx.input::<TodoList>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("list payload missing"))
    }
}

#[async_trait]
impl RetrieveManyProcessor for ListStore {
    async fn process_retrieve_many(&self, ctx: &mut Context) -> Result<()> {
        let page_size = ctx.request().page_size.unwrap_or(50).max(1);
        let page = ctx.request().page.unwrap_or(1).max(1);
        let (total, lists) = {
            let lists = self.lists.read();
            let page: Vec<Arc<dyn Entity>> = lists
                .values()
                .skip((page - 1) * page_size)
                .take(page_size)
                .map(|list| Arc::new(list.clone()) as Arc<dyn Entity>)
                .collect();
            (lists.len(), page)
        };
        ctx.set_count(total);
        ctx.set_output_list(lists);
        Ok(())
    }
}

#[async_trait]
impl RetrieveProcessor for ListStore {
    async fn process_retrieve(&self, ctx: &mut Context) -> Result<()> {
        let id = Self::object_id(ctx)?;
        let list = self.lists.read().get(&id).cloned();
        ctx.set_output_entity(list.ok_or_else(|| Self::not_found(&id))?);
        Ok(())
    }
}

#[async_trait]
impl CreateProcessor for ListStore {
    async fn process_create(&self, ctx: &mut Context) -> Result<()> {
        let mut list = Self::input(ctx)?;
        if list.id.is_empty() {
            list.id = uuid::Uuid::new_v4().to_string();
        }
        {
            let mut lists = self.lists.write();
            if lists.contains_key(&list.id) {
                return Err(
                    ApiError::conflict(format!("list '{}' already exists", list.id), "lists")
                        .into(),
                );
            }
            lists.insert(list.id.clone(), list.clone());
        }
        info!(list_id = %list.id, "list created");
        ctx.set_output_entity(list);
        Ok(())
    }
}

#[async_trait]
impl UpdateProcessor for ListStore {
    async fn process_update(&self, ctx: &mut Context) -> Result<()> {
        let id = Self::object_id(ctx)?;
        let mut list = Self::input(ctx)?;
        list.id.clone_from(&id);
        {
            let mut lists = self.lists.write();
            let Some(slot) = lists.get_mut(&id) else {
                return Err(Self::not_found(&id));
            };
            *slot = list.clone();
        }
        ctx.set_output_entity(list);
        Ok(())
    }
}

#[async_trait]
impl DeleteProcessor for ListStore {
    async fn process_delete(&self, ctx: &mut Context) -> Result<()> {
        let id = Self::object_id(ctx)?;
        let removed = self.lists.write().remove(&id);
        ctx.set_output_entity(removed.ok_or_else(|| Self::not_found(&id))?);
        Ok(())
    }
}

#[async_trait]
impl PatchProcessor for ListStore {
    async fn process_patch(&self, ctx: &mut Context) -> Result<()> {
        let id = Self::object_id(ctx)?;
        let assignation = ctx
            .input::<Assignation>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("assignation payload missing"))?;
        {
            let mut lists = self.lists.write();
            let Some(list) = lists.get_mut(&id) else {
                return Err(Self::not_found(&id));
            };
            match assignation.kind {
                AssignationType::Add => {
                    for item in &assignation.ids {
                        if !list.items.contains(item) {
                            list.items.push(item.clone());
                        }
                    }
                }
                AssignationType::Remove => list.items.retain(|item| !assignation.ids.contains(item)),
                AssignationType::Set => list.items.clone_from(&assignation.ids),
            }
        }
        ctx.set_output_entity(assignation);
        Ok(())
    }
}

#[async_trait]
impl InfoProcessor for ListStore {
    async fn process_info(&self, ctx: &mut Context) -> Result<()> {
        let total = self.lists.read().len();
        ctx.set_count(total);
        Ok(())
    }
}

impl Processor for ListStore {
    fn as_retrieve_many(&self) -> Option<&dyn RetrieveManyProcessor> {
        Some(self)
    }

    fn as_retrieve(&self) -> Option<&dyn RetrieveProcessor> {
        Some(self)
    }

    fn as_create(&self) -> Option<&dyn CreateProcessor> {
        Some(self)
    }

    fn as_update(&self) -> Option<&dyn UpdateProcessor> {
        Some(self)
    }

    fn as_delete(&self) -> Option<&dyn DeleteProcessor> {
        Some(self)
    }

    fn as_patch(&self) -> Option<&dyn PatchProcessor> {
        Some(self)
    }

    fn as_info(&self) -> Option<&dyn InfoProcessor> {
        Some(self)
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tidewire_server=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let models = Arc::new(ModelRegistry::new().register::<TodoList>(list_identity()));
    let processors = Arc::new(ProcessorRegistry::new());
    processors.register(&list_identity(), Arc::new(ListStore::default()))?;

    let push = Arc::new(PushServer::new(PushConfig::default()));
    let config = ServerConfig {
        read_only: args.read_only,
        ..ServerConfig::default()
    };
    let dispatcher = Dispatcher::new(config, models.clone(), processors)
        .with_event_pusher(push.clone());
    let pipeline = build_dispatch_pipeline(Arc::new(dispatcher), None);

    let network = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, pipeline, models, push);
    let port = module.start().await?;
    info!(port, read_only = args.read_only, "tidewire demo server listening");

    module.serve(shutdown_signal()).await
}
