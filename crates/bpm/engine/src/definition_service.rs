//! Definition service: versioned flow templates
//!
//! A code has any number of versions. Drafts are editable; publishing
//! freezes a version and makes it the single main version of its code,
//! which is what new instances start from.

use crate::engine::Engine;
use crate::graph::validate_definition;
use crate::store::{FlowStore, StoreTx};
use bpm_types::{
    Actor, DefinitionStatus, FlowDefinition, FlowDefinitionId, FlowError, FlowGraph, FlowResult,
    FormField, NodeConfig, NodeId, UserId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Content of a new draft
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDraft {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub graph: FlowGraph,
    #[serde(default)]
    pub form_schema: Vec<FormField>,
    #[serde(default)]
    pub node_configs: HashMap<NodeId, NodeConfig>,
}

/// Partial update of a draft; `None` leaves a field unchanged
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub graph: Option<FlowGraph>,
    pub form_schema: Option<Vec<FormField>>,
    pub node_configs: Option<HashMap<NodeId, NodeConfig>>,
}

#[derive(Clone)]
pub struct DefinitionService {
    store: Arc<dyn FlowStore>,
    engine: Arc<Engine>,
}

impl DefinitionService {
    pub fn new(store: Arc<dyn FlowStore>, engine: Arc<Engine>) -> Self {
        Self { store, engine }
    }

    /// Create the next version of a code as a draft
    pub async fn create_draft(
        &self,
        draft: DefinitionDraft,
        actor: &Actor,
    ) -> FlowResult<FlowDefinition> {
        if draft.code.trim().is_empty() {
            return Err(FlowError::validation("definition code must not be empty"));
        }
        if draft.name.trim().is_empty() {
            return Err(FlowError::validation("definition name must not be empty"));
        }
        let created_by = actor
            .user_id()
            .cloned()
            .unwrap_or_else(|| UserId::new(actor.display_name()));

        let mut tx = self.store.begin().await?;
        let version = next_version(tx.as_mut(), &draft.code).await?;

        let mut definition = FlowDefinition::draft(draft.code, draft.name, draft.graph, created_by);
        definition.version = version;
        definition.description = draft.description;
        definition.category = draft.category;
        definition.form_schema = draft.form_schema;
        definition.node_configs = draft.node_configs;

        tx.save_definition(&definition).await?;
        tx.commit().await?;

        tracing::info!(
            definition_id = %definition.id,
            code = %definition.code,
            version = definition.version,
            "Draft definition created"
        );
        Ok(definition)
    }

    pub async fn update_draft(
        &self,
        id: &FlowDefinitionId,
        patch: DefinitionPatch,
    ) -> FlowResult<FlowDefinition> {
        let mut tx = self.store.begin().await?;
        let mut definition = require(tx.as_mut(), id).await?;
        if !definition.is_editable() {
            return Err(FlowError::precondition(format!(
                "definition {} v{} is not a draft",
                definition.code, definition.version
            )));
        }

        if let Some(name) = patch.name {
            definition.name = name;
        }
        if let Some(description) = patch.description {
            definition.description = description;
        }
        if let Some(category) = patch.category {
            definition.category = Some(category);
        }
        if let Some(graph) = patch.graph {
            definition.graph = graph;
        }
        if let Some(form_schema) = patch.form_schema {
            definition.form_schema = form_schema;
        }
        if let Some(node_configs) = patch.node_configs {
            definition.node_configs = node_configs;
        }
        definition.updated_at = Utc::now();

        tx.save_definition(&definition).await?;
        tx.commit().await?;
        self.engine.graphs().invalidate(id);

        tracing::debug!(definition_id = %id, "Draft definition updated");
        Ok(definition)
    }

    /// Validate and publish a version, making it the main version of its
    /// code. Every other main row of the code loses the flag in the same
    /// transaction.
    pub async fn publish(&self, id: &FlowDefinitionId, actor: &Actor) -> FlowResult<FlowDefinition> {
        let mut tx = self.store.begin().await?;
        let mut definition = require(tx.as_mut(), id).await?;
        if definition.is_published() && definition.is_main {
            return Err(FlowError::precondition(format!(
                "definition {} v{} is already the published main version",
                definition.code, definition.version
            )));
        }
        validate_definition(&definition)?;

        let now = Utc::now();
        let mut demoted = 0usize;
        for mut other in tx.definitions_by_code(&definition.code).await? {
            if other.id != definition.id && other.is_main {
                other.is_main = false;
                other.updated_at = now;
                tx.save_definition(&other).await?;
                demoted += 1;
            }
        }

        definition.status = DefinitionStatus::Published;
        definition.is_main = true;
        definition.published_at = Some(now);
        definition.updated_at = now;
        tx.save_definition(&definition).await?;
        tx.commit().await?;
        self.engine.graphs().invalidate(id);

        tracing::info!(
            definition_id = %definition.id,
            code = %definition.code,
            version = definition.version,
            demoted,
            actor = %actor,
            "Definition published"
        );
        Ok(definition)
    }

    /// Withdraw a version. Instances already running on it continue.
    pub async fn disable(&self, id: &FlowDefinitionId, actor: &Actor) -> FlowResult<FlowDefinition> {
        let mut tx = self.store.begin().await?;
        let mut definition = require(tx.as_mut(), id).await?;
        if definition.status == DefinitionStatus::Disabled {
            return Err(FlowError::precondition(format!(
                "definition {} v{} is already disabled",
                definition.code, definition.version
            )));
        }

        definition.status = DefinitionStatus::Disabled;
        definition.is_main = false;
        definition.updated_at = Utc::now();
        tx.save_definition(&definition).await?;
        tx.commit().await?;

        tracing::info!(definition_id = %id, code = %definition.code, actor = %actor, "Definition disabled");
        Ok(definition)
    }

    /// Copy an existing version into a new draft at the next version
    pub async fn derive_version(
        &self,
        id: &FlowDefinitionId,
        actor: &Actor,
    ) -> FlowResult<FlowDefinition> {
        let source = self.get(id).await?;
        self.create_draft(
            DefinitionDraft {
                code: source.code,
                name: source.name,
                description: source.description,
                category: source.category,
                graph: source.graph,
                form_schema: source.form_schema,
                node_configs: source.node_configs,
            },
            actor,
        )
        .await
    }

    pub async fn get(&self, id: &FlowDefinitionId) -> FlowResult<FlowDefinition> {
        let mut tx = self.store.begin().await?;
        require(tx.as_mut(), id).await
    }

    /// Every version of a code, oldest first
    pub async fn versions(&self, code: &str) -> FlowResult<Vec<FlowDefinition>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.definitions_by_code(code).await?)
    }

    pub async fn list(&self) -> FlowResult<Vec<FlowDefinition>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_definitions().await?)
    }

    /// The published main version new instances of `code` start from
    pub async fn main_for_code(&self, code: &str) -> FlowResult<FlowDefinition> {
        let mut tx = self.store.begin().await?;
        main_definition(tx.as_mut(), code).await
    }
}

pub(crate) async fn main_definition(tx: &mut dyn StoreTx, code: &str) -> FlowResult<FlowDefinition> {
    tx.definitions_by_code(code)
        .await?
        .into_iter()
        .find(|d| d.is_main && d.is_published())
        .ok_or_else(|| FlowError::NoMainDefinition(code.to_string()))
}

async fn require(tx: &mut dyn StoreTx, id: &FlowDefinitionId) -> FlowResult<FlowDefinition> {
    tx.get_definition(id)
        .await?
        .ok_or_else(|| FlowError::DefinitionNotFound(id.clone()))
}

async fn next_version(tx: &mut dyn StoreTx, code: &str) -> FlowResult<u32> {
    let latest = tx
        .definitions_by_code(code)
        .await?
        .iter()
        .map(|d| d.version)
        .max()
        .unwrap_or(0);
    Ok(latest + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{actor, specific, Harness};
    use bpm_types::{ErrorKind, FlowNode};

    fn leave_draft() -> DefinitionDraft {
        let graph = FlowGraph::new()
            .node(FlowNode::start("start"))
            .node(FlowNode::approval("review", "Review"))
            .node(FlowNode::end("end"))
            .connect("start", "review")
            .connect("review", "end");
        DefinitionDraft {
            code: "leave".into(),
            name: "Leave request".into(),
            graph,
            node_configs: HashMap::from([(NodeId::new("review"), NodeConfig::new(specific(&["bob"])))]),
            ..Default::default()
        }
    }

    fn service(h: &Harness) -> DefinitionService {
        DefinitionService::new(h.store.clone(), h.engine.clone())
    }

    #[tokio::test]
    async fn test_versions_increment() {
        let h = Harness::new().await;
        let svc = service(&h);
        let admin = actor("erin");

        let v1 = svc.create_draft(leave_draft(), &admin).await.unwrap();
        let v2 = svc.create_draft(leave_draft(), &admin).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.status, DefinitionStatus::Draft);
        assert!(!v1.is_main);

        let derived = svc.derive_version(&v1.id, &admin).await.unwrap();
        assert_eq!(derived.version, 3);
        assert_eq!(derived.graph, v1.graph);
        assert_eq!(svc.versions("leave").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_keeps_single_main() {
        let h = Harness::new().await;
        let svc = service(&h);
        let admin = actor("erin");

        let v1 = svc.create_draft(leave_draft(), &admin).await.unwrap();
        let v2 = svc.create_draft(leave_draft(), &admin).await.unwrap();
        svc.publish(&v1.id, &admin).await.unwrap();
        assert_eq!(svc.main_for_code("leave").await.unwrap().id, v1.id);

        svc.publish(&v2.id, &admin).await.unwrap();
        let versions = svc.versions("leave").await.unwrap();
        assert_eq!(versions.iter().filter(|d| d.is_main).count(), 1);
        assert_eq!(svc.main_for_code("leave").await.unwrap().id, v2.id);
        assert!(versions[0].is_published());

        let err = svc.publish(&v2.id, &admin).await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_publish_validates_graph() {
        let h = Harness::new().await;
        let svc = service(&h);
        let admin = actor("erin");

        let mut draft = leave_draft();
        draft.node_configs.clear();
        let def = svc.create_draft(draft, &admin).await.unwrap();
        let err = svc.publish(&def.id, &admin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(svc.main_for_code("leave").await.is_err());
    }

    #[tokio::test]
    async fn test_update_only_drafts() {
        let h = Harness::new().await;
        let svc = service(&h);
        let admin = actor("erin");

        let def = svc.create_draft(leave_draft(), &admin).await.unwrap();
        let updated = svc
            .update_draft(
                &def.id,
                DefinitionPatch {
                    name: Some("Annual leave".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Annual leave");

        svc.publish(&def.id, &admin).await.unwrap();
        let err = svc
            .update_draft(&def.id, DefinitionPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_disable_clears_main() {
        let h = Harness::new().await;
        let svc = service(&h);
        let admin = actor("erin");

        let def = svc.create_draft(leave_draft(), &admin).await.unwrap();
        svc.publish(&def.id, &admin).await.unwrap();
        let disabled = svc.disable(&def.id, &admin).await.unwrap();
        assert_eq!(disabled.status, DefinitionStatus::Disabled);
        assert!(!disabled.is_main);

        let err = svc.main_for_code("leave").await.unwrap_err();
        assert!(matches!(err, FlowError::NoMainDefinition(_)));
    }

    #[tokio::test]
    async fn test_create_draft_requires_code() {
        let h = Harness::new().await;
        let svc = service(&h);
        let mut draft = leave_draft();
        draft.code = " ".into();
        let err = svc.create_draft(draft, &actor("erin")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let seeded = svc.create_draft(leave_draft(), &Actor::System).await.unwrap();
        assert_eq!(seeded.created_by.as_str(), "system");
    }
}
