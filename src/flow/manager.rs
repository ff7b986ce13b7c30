//! Flow manager
//!
//! Owns every flow of the process. Reads go through an `ArcSwap` snapshot of
//! the flow map and never block; mutating operations are serialized by an
//! async mutex and publish a new snapshot when they are done.

use arc_swap::ArcSwap;
use std::{collections::HashMap, path::Path, sync::Arc};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::connector::Adapters;
use crate::context::{ContextStore, Scope};
use crate::error::{FlowError, Result};
use crate::flow::runtime::Flow;
use crate::flow::storage::{flow_id_from_path, FlowStorage};
use crate::flow::types::{FlowControlOp, FlowListItem, FlowMeta, FlowState};
use crate::flow::validate::validate;
use crate::node::NodeRegistry;

pub struct Manager {
    flows: ArcSwap<HashMap<String, Arc<Flow>>>,
    /// Serializes mutating operations
    ops: Mutex<()>,
    storage: FlowStorage,
    context: Arc<ContextStore>,
    adapters: Arc<Adapters>,
    registry: Arc<NodeRegistry>,
    engine: EngineConfig,
}

impl Manager {
    pub fn new(
        storage: FlowStorage,
        context: Arc<ContextStore>,
        adapters: Arc<Adapters>,
        registry: Arc<NodeRegistry>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
            ops: Mutex::new(()),
            storage,
            context,
            adapters,
            registry,
            engine,
        }
    }

    pub fn storage(&self) -> &FlowStorage {
        &self.storage
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn adapters(&self) -> &Arc<Adapters> {
        &self.adapters
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Parse, validate and register one definition file.
    /// The file name is authoritative for the flow id.
    pub async fn load_flow_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.load_file(path.as_ref()).await
    }

    async fn load_file(&self, path: &Path) -> Result<()> {
        let id = flow_id_from_path(path)
            .ok_or_else(|| FlowError::Validation(format!("can't derive a flow id from {}", path.display())))?;
        let bytes = tokio::fs::read(path).await?;
        let mut meta: FlowMeta = serde_json::from_slice(&bytes)?;
        if meta.id != id {
            if !meta.id.is_empty() {
                tracing::warn!("Flow file {} declares id '{}', using '{}'", path.display(), meta.id, id);
            }
            meta.id = id;
        }
        validate(&meta, &self.registry)?;
        self.install(meta).await;
        Ok(())
    }

    /// Load every definition in storage; bad files are logged and skipped
    pub async fn load_all_flows_from_storage(&self) -> Result<usize> {
        let _guard = self.ops.lock().await;
        self.storage.init().await?;

        let mut loaded = 0;
        for path in self.storage.list().await? {
            match self.load_file(&path).await {
                Ok(()) => loaded += 1,
                Err(e) => tracing::error!("Skipping flow file {}: {}", path.display(), e),
            }
        }
        tracing::info!("Loaded {} flows from {}", loaded, self.storage.dir().display());
        Ok(loaded)
    }

    /// Swap `meta` in, stopping the flow it replaces, and start it unless disabled
    async fn install(&self, meta: FlowMeta) -> Arc<Flow> {
        let id = meta.id.clone();
        let is_disabled = meta.is_disabled;
        let flow = Arc::new(Flow::new(
            meta,
            self.context.clone(),
            self.adapters.clone(),
            self.registry.clone(),
            self.engine,
        ));

        if let Some(old) = self.flows.load().get(&id).cloned() {
            if let Err(e) = old.stop().await {
                tracing::warn!(fid = %id, "Stopping replaced flow failed: {}", e);
            }
        }

        let mut flows = (**self.flows.load()).clone();
        flows.insert(id.clone(), flow.clone());
        self.flows.store(Arc::new(flows));

        if is_disabled {
            tracing::info!(fid = %id, "Flow is disabled, not starting");
        } else if let Err(e) = flow.start().await {
            // reported through the FAILED state
            tracing::warn!(fid = %id, "Flow registered but not running: {}", e);
        }
        flow
    }

    pub fn get_flow_list(&self) -> Vec<FlowListItem> {
        let mut items: Vec<FlowListItem> = self.flows.load().values().map(|f| f.list_item()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn get_flow_by_id(&self, id: &str) -> Option<Arc<Flow>> {
        self.flows.load().get(id).cloned()
    }

    pub fn get_flow_definition(&self, id: &str) -> Option<FlowMeta> {
        self.get_flow_by_id(id).map(|f| f.definition())
    }

    /// Fresh empty definition with a new id; not persisted
    pub fn generate_new_flow(&self) -> FlowMeta {
        FlowMeta::skeleton(uuid::Uuid::new_v4().to_string())
    }

    /// Validate and persist a definition, then replace the running flow.
    /// On any error the previous flow stays as it was.
    pub async fn update_flow_from_json_and_save_to_storage(&self, id: &str, raw: &[u8]) -> Result<()> {
        let _guard = self.ops.lock().await;
        let mut meta: FlowMeta = serde_json::from_slice(raw)?;
        if meta.id.is_empty() {
            meta.id = id.to_string();
        } else if meta.id != id {
            return Err(FlowError::Validation(format!(
                "definition id '{}' doesn't match '{}'",
                meta.id, id
            )));
        }

        validate(&meta, &self.registry)?;
        self.storage.save(&meta).await?;
        self.install(meta).await;
        tracing::info!(fid = %id, "Flow definition updated");
        Ok(())
    }

    /// Import a definition; a missing id is allocated, an existing id is overwritten
    pub async fn import_flow(&self, raw: &[u8]) -> Result<String> {
        let _guard = self.ops.lock().await;
        let mut meta: FlowMeta = serde_json::from_slice(raw)?;
        if meta.id.is_empty() {
            meta.id = uuid::Uuid::new_v4().to_string();
        } else if self.get_flow_by_id(&meta.id).is_some() {
            tracing::info!(fid = %meta.id, "Import overwrites existing flow");
        }
        if meta.created_at.is_empty() {
            meta.created_at = chrono::Utc::now().to_rfc3339();
        }

        validate(&meta, &self.registry)?;
        self.storage.save(&meta).await?;
        let id = meta.id.clone();
        self.install(meta).await;
        tracing::info!(fid = %id, "Flow imported");
        Ok(id)
    }

    /// Stop and forget a flow, removing its file and flow-scoped variables.
    /// Unknown ids are a no-op.
    pub async fn delete_flow_from_storage(&self, id: &str) -> Result<()> {
        let _guard = self.ops.lock().await;
        if let Some(flow) = self.get_flow_by_id(id) {
            flow.stop().await?;
            let mut flows = (**self.flows.load()).clone();
            flows.remove(id);
            self.flows.store(Arc::new(flows));
        } else if self.storage.path_for(id).is_err() {
            return Ok(());
        }

        self.storage.delete(id).await?;
        self.context.delete_scope(&Scope::flow(id)).await?;
        tracing::info!(fid = %id, "Flow deleted");
        Ok(())
    }

    pub async fn control_flow(&self, op: FlowControlOp, id: &str) -> Result<()> {
        let _guard = self.ops.lock().await;
        let flow = self
            .get_flow_by_id(id)
            .ok_or_else(|| FlowError::NotFound(format!("flow '{}'", id)))?;
        let state = flow.state();
        let rejected = || FlowError::InvalidStateTransition {
            flow_id: id.to_string(),
            op: op.as_str().to_lowercase(),
            state,
        };

        match op {
            FlowControlOp::Start => {
                if matches!(state, FlowState::Running | FlowState::Starting) {
                    return Err(rejected());
                }
                self.persist_disabled(&flow, false).await?;
                flow.start().await
            }
            FlowControlOp::Stop => {
                if matches!(state, FlowState::Created | FlowState::Stopping | FlowState::Stopped) {
                    return Err(rejected());
                }
                self.persist_disabled(&flow, true).await?;
                flow.stop().await
            }
            FlowControlOp::SendInclusionReport => flow.send_inclusion_report(),
            FlowControlOp::SendExclusionReport => flow.send_exclusion_report(),
        }
    }

    /// Write the enabled/disabled flag before touching the running flow
    async fn persist_disabled(&self, flow: &Flow, disabled: bool) -> Result<()> {
        if flow.is_disabled() == disabled {
            return Ok(());
        }
        let mut meta = flow.definition();
        meta.is_disabled = disabled;
        self.storage.save(&meta).await?;
        flow.set_disabled(disabled);
        Ok(())
    }

    /// Stop every flow, then every connector
    pub async fn shutdown(&self) {
        let _guard = self.ops.lock().await;
        for flow in self.flows.load().values() {
            if let Err(e) = flow.stop().await {
                tracing::warn!(fid = %flow.id(), "Stopping flow failed: {}", e);
            }
        }
        tracing::info!("All flows stopped");
        self.adapters.stop_all().await;
    }
}
