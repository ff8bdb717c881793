//! The standard VDP processing plan and its collaborators.
//!
//! | stage           | saga steps                          | compensation             |
//! |-----------------|-------------------------------------|--------------------------|
//! | ingest          | (none)                              |                          |
//! | fetch_media     | download-media, gcs-upload          | cleanup_temp, rollback_upload |
//! | vdp_extract     | vdp-extraction, persist-vdp         | (none), rollback_upload  |
//! | enrich_complete | enrich                              | (none)                   |
//! | load_bq         | bigquery-load, verify-load          | delete_bq_record, (none) |
//! | finalize        | cleanup-temp                        | (none)                   |

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;

use super::plan::{StageContext, StagePlan};
use crate::core::PipelineStage;
use crate::errors::{Result, ValidationError, VdpflowError};
use crate::resilience::{ExtractionRequest, HealthCheckedRouter};
use crate::saga::{
    CompensationAction, CompensationExecutor, CompensationKind, IdempotentCompensator, SagaStep,
};
use crate::utils::iso_timestamp;

/// Default warehouse table.
pub const DEFAULT_TABLE: &str = "vdp_gold";

/// Object storage for media and artifacts.
///
/// `delete` and `cleanup_temp` must succeed when the target is already gone.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Downloads the source media to a temporary location.
    async fn download(&self, content_key: &str, source_url: &str) -> Result<String>;

    /// Uploads a temporary file; returns the object URI.
    async fn upload(&self, content_key: &str, temp_path: &str) -> Result<String>;

    /// Stores a JSON artifact; returns the object URI.
    async fn store_artifact(&self, content_key: &str, name: &str, body: &serde_json::Value) -> Result<String>;

    /// Deletes an object.
    async fn delete(&self, uri: &str) -> Result<()>;

    /// Removes a temporary path.
    async fn cleanup_temp(&self, path: &str) -> Result<()>;
}

/// The analytics warehouse.
///
/// `delete_record` must succeed when the record is already gone.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Loads one row for `content_key`.
    async fn load(&self, table: &str, content_key: &str, row: &serde_json::Value) -> Result<()>;

    /// Rows stored for `content_key`.
    async fn count(&self, table: &str, content_key: &str) -> Result<u64>;

    /// Deletes the rows for `content_key`.
    async fn delete_record(&self, table: &str, content_key: &str) -> Result<()>;
}

/// Everything the standard plan talks to.
#[derive(Clone)]
pub struct VdpCollaborators {
    /// Media and artifact storage.
    pub media: Arc<dyn MediaStore>,
    /// Warehouse.
    pub warehouse: Arc<dyn Warehouse>,
    /// Router over extraction backends.
    pub router: Arc<HealthCheckedRouter>,
}

/// Maps compensating actions onto the collaborators.
#[derive(Clone)]
pub struct CollaboratorCompensator {
    media: Arc<dyn MediaStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl CollaboratorCompensator {
    /// Creates a compensator.
    #[must_use]
    pub fn new(media: Arc<dyn MediaStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { media, warehouse }
    }
}

/// A non-empty string parameter of `action`.
fn required_param<'a>(action: &'a CompensationAction, param: &str) -> Result<&'a str> {
    action
        .param_str(param)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ValidationError::new(
                "COMP-001-MISSING-PARAM",
                format!("{} action is missing '{param}'", action.action),
            )
            .with_field(param)
            .into()
        })
}

#[async_trait]
impl CompensationExecutor for CollaboratorCompensator {
    async fn execute(&self, action: &CompensationAction) -> Result<()> {
        match action.action {
            CompensationKind::RollbackUpload => {
                let uri = required_param(action, "uri")?;
                self.media.delete(uri).await
            }
            CompensationKind::DeleteBqRecord => {
                let table = action.param_str("table").unwrap_or(DEFAULT_TABLE);
                let key = required_param(action, "content_key")?;
                self.warehouse.delete_record(table, key).await
            }
            CompensationKind::CleanupTemp => {
                let path = required_param(action, "path")?;
                self.media.cleanup_temp(path).await
            }
        }
    }
}

/// Outputs shared between the steps of one stage saga.
type Scratch = Arc<Mutex<serde_json::Map<String, serde_json::Value>>>;

fn scratch_str(scratch: &Scratch, step_id: &str, field: &str) -> Result<String> {
    scratch
        .lock()
        .get(step_id)
        .and_then(|v| v.get(field))
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .ok_or_else(|| VdpflowError::DataIntegrity(format!("step '{step_id}' produced no '{field}'")))
}

fn required_artifact(ctx: &StageContext, step_id: &str, field: &str) -> Result<String> {
    ctx.artifact_str(step_id, field)
        .map(String::from)
        .ok_or_else(|| {
            VdpflowError::DataIntegrity(format!(
                "{}: missing artifact {step_id}.{field}",
                ctx.content_key
            ))
        })
}

fn record(scratch: &Scratch, step_id: &str, output: serde_json::Value) -> serde_json::Value {
    scratch.lock().insert(step_id.to_string(), output.clone());
    output
}

type Compensator = Arc<dyn CompensationExecutor>;

fn compensate_with(
    executor: &Compensator,
    build: impl FnOnce(&serde_json::Value) -> Result<CompensationAction> + Send + 'static,
) -> impl FnOnce(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + 'static {
    let executor = executor.clone();
    move |output| -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let action = build(&output)?;
            executor.execute(&action).await
        })
    }
}

/// Builds the sagas of the standard VDP pipeline.
pub struct VdpStagePlan {
    collaborators: VdpCollaborators,
    compensator: Compensator,
    table: String,
}

impl VdpStagePlan {
    /// The standard plan, compensating through the collaborators.
    #[must_use]
    pub fn standard(collaborators: VdpCollaborators) -> Self {
        let compensator = Arc::new(CollaboratorCompensator::new(
            collaborators.media.clone(),
            collaborators.warehouse.clone(),
        ));
        Self {
            collaborators,
            compensator,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Replaces the compensation executor.
    #[must_use]
    pub fn with_compensator(mut self, compensator: Arc<dyn CompensationExecutor>) -> Self {
        self.compensator = compensator;
        self
    }

    /// Loads into `table` instead of the default.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Executor for one stage saga. Deduplication never outlives the saga.
    fn saga_compensator(&self) -> Compensator {
        Arc::new(IdempotentCompensator::new(self.compensator.clone()))
    }

    fn fetch_media(&self, ctx: &StageContext) -> Result<Vec<SagaStep>> {
        let source_url = ctx.meta("source_url").map(String::from).ok_or_else(|| {
            VdpflowError::from(
                ValidationError::new("FETCH-001-NO-SOURCE", "item has no source_url")
                    .with_field("source_url"),
            )
        })?;
        let scratch = Scratch::default();
        let compensator = self.saga_compensator();

        let download = {
            let media = self.collaborators.media.clone();
            let key = ctx.content_key.clone();
            let scratch = scratch.clone();
            SagaStep::new(
                "download-media",
                move || async move {
                    let temp_path = media.download(&key, &source_url).await?;
                    Ok(record(&scratch, "download-media", serde_json::json!({ "temp_path": temp_path })))
                },
                compensate_with(&compensator, |output| {
                    let path = output
                        .get("temp_path")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default();
                    Ok(CompensationAction::cleanup_temp(PipelineStage::FetchMedia, path))
                }),
            )
        };

        let upload = {
            let media = self.collaborators.media.clone();
            let key = ctx.content_key.clone();
            SagaStep::new(
                "gcs-upload",
                move || async move {
                    let temp_path = scratch_str(&scratch, "download-media", "temp_path")?;
                    let uri = media.upload(&key, &temp_path).await?;
                    Ok(serde_json::json!({ "uri": uri }))
                },
                compensate_with(&compensator, |output| {
                    let uri = output.get("uri").and_then(serde_json::Value::as_str).unwrap_or_default();
                    Ok(CompensationAction::rollback_upload(uri))
                }),
            )
        };

        Ok(vec![download, upload])
    }

    fn vdp_extract(&self, ctx: &StageContext) -> Result<Vec<SagaStep>> {
        let source_uri = required_artifact(ctx, "gcs-upload", "uri")?;
        let mut request = ExtractionRequest::new(source_uri, &ctx.platform);
        if let Some(language) = ctx.meta("language") {
            request = request.with_language(language);
        }
        if let Some(url) = ctx.meta("source_url") {
            request = request.with_source_url(url);
        }
        let scratch = Scratch::default();
        let compensator = self.saga_compensator();

        let extraction = {
            let router = self.collaborators.router.clone();
            let token = ctx.token.clone();
            let scratch = scratch.clone();
            SagaStep::irreversible("vdp-extraction", move || async move {
                let routed = router.route(&request, &token).await?;
                Ok(record(
                    &scratch,
                    "vdp-extraction",
                    serde_json::json!({ "backend": routed.backend, "vdp": routed.body }),
                ))
            })
        };

        let persist = {
            let media = self.collaborators.media.clone();
            let key = ctx.content_key.clone();
            SagaStep::new(
                "persist-vdp",
                move || async move {
                    let vdp = scratch
                        .lock()
                        .get("vdp-extraction")
                        .and_then(|v| v.get("vdp"))
                        .cloned()
                        .ok_or_else(|| VdpflowError::DataIntegrity(format!("{key}: extraction produced no body")))?;
                    let uri = media.store_artifact(&key, "vdp.json", &vdp).await?;
                    Ok(serde_json::json!({ "uri": uri }))
                },
                compensate_with(&compensator, |output| {
                    let uri = output.get("uri").and_then(serde_json::Value::as_str).unwrap_or_default();
                    Ok(CompensationAction::rollback_upload(uri))
                }),
            )
        };

        Ok(vec![extraction, persist])
    }

    fn enrich(ctx: &StageContext) -> Result<Vec<SagaStep>> {
        let vdp = ctx
            .artifact("vdp-extraction")
            .and_then(|v| v.get("vdp"))
            .cloned()
            .ok_or_else(|| VdpflowError::DataIntegrity(format!("{}: missing extraction result", ctx.content_key)))?;
        let enriched = serde_json::json!({
            "content_key": ctx.content_key,
            "platform": ctx.platform,
            "correlation_id": ctx.correlation_id,
            "language": ctx.meta("language"),
            "source_url": ctx.meta("source_url"),
            "vdp_uri": ctx.artifact_str("persist-vdp", "uri"),
            "vdp": vdp,
        });

        Ok(vec![SagaStep::irreversible("enrich", move || async move {
            let mut enriched = enriched;
            enriched["enriched_at"] = serde_json::json!(iso_timestamp());
            Ok(enriched)
        })])
    }

    fn load_bq(&self, ctx: &StageContext) -> Result<Vec<SagaStep>> {
        let row = ctx
            .artifact("enrich")
            .cloned()
            .ok_or_else(|| VdpflowError::DataIntegrity(format!("{}: missing enriched record", ctx.content_key)))?;
        let compensator = self.saga_compensator();

        let load = {
            let warehouse = self.collaborators.warehouse.clone();
            let table = self.table.clone();
            let key = ctx.content_key.clone();
            let (comp_table, comp_key) = (table.clone(), key.clone());
            SagaStep::new(
                "bigquery-load",
                move || async move {
                    warehouse.load(&table, &key, &row).await?;
                    Ok(serde_json::json!({ "table": table, "content_key": key }))
                },
                compensate_with(&compensator, move |_| {
                    Ok(CompensationAction::delete_bq_record(&comp_table, &comp_key))
                }),
            )
        };

        let verify = {
            let warehouse = self.collaborators.warehouse.clone();
            let table = self.table.clone();
            let key = ctx.content_key.clone();
            SagaStep::irreversible("verify-load", move || async move {
                let rows = warehouse.count(&table, &key).await?;
                if rows != 1 {
                    return Err(VdpflowError::DataIntegrity(format!(
                        "{key}: expected 1 row in {table}, found {rows}"
                    )));
                }
                Ok(serde_json::json!({ "rows": rows }))
            })
        };

        Ok(vec![load, verify])
    }

    fn finalize(&self, ctx: &StageContext) -> Vec<SagaStep> {
        let media = self.collaborators.media.clone();
        let temp_path = ctx.artifact_str("download-media", "temp_path").map(String::from);
        vec![SagaStep::irreversible("cleanup-temp", move || async move {
            if let Some(path) = &temp_path {
                media.cleanup_temp(path).await?;
            }
            Ok(serde_json::json!({ "finalized_at": iso_timestamp() }))
        })]
    }
}

impl StagePlan for VdpStagePlan {
    fn steps(&self, stage: PipelineStage, ctx: &StageContext) -> Result<Vec<SagaStep>> {
        match stage {
            PipelineStage::Ingest => Ok(Vec::new()),
            PipelineStage::FetchMedia => self.fetch_media(ctx),
            PipelineStage::VdpExtract => self.vdp_extract(ctx),
            PipelineStage::EnrichComplete => Self::enrich(ctx),
            PipelineStage::LoadBq => self.load_bq(ctx),
            PipelineStage::Finalize => Ok(self.finalize(ctx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMediaStore, RecordingWarehouse};

    fn compensator() -> (CollaboratorCompensator, Arc<RecordingMediaStore>, Arc<RecordingWarehouse>) {
        let media = Arc::new(RecordingMediaStore::new());
        let warehouse = Arc::new(RecordingWarehouse::new());
        (
            CollaboratorCompensator::new(media.clone(), warehouse.clone()),
            media,
            warehouse,
        )
    }

    #[tokio::test]
    async fn test_compensator_dispatches_actions() {
        let (comp, media, warehouse) = compensator();

        comp.execute(&CompensationAction::rollback_upload("gs://vdp/youtube/a.mp4"))
            .await
            .unwrap();
        comp.execute(&CompensationAction::cleanup_temp(PipelineStage::FetchMedia, "/tmp/a"))
            .await
            .unwrap();
        comp.execute(&CompensationAction::delete_bq_record("vdp_gold", "youtube:a"))
            .await
            .unwrap();

        assert_eq!(media.deleted(), vec!["gs://vdp/youtube/a.mp4"]);
        assert_eq!(media.cleaned(), vec!["/tmp/a"]);
        assert_eq!(warehouse.deleted(), vec!["vdp_gold/youtube:a"]);
    }

    #[tokio::test]
    async fn test_compensator_rejects_missing_params() {
        let (comp, _, _) = compensator();
        let action = CompensationAction::new(
            PipelineStage::FetchMedia,
            CompensationKind::RollbackUpload,
            serde_json::json!({}),
        );
        let err = comp.execute(&action).await.unwrap_err();
        assert!(err.to_string().contains("uri"));
    }

    #[tokio::test]
    async fn test_compensator_rejects_empty_params() {
        let (comp, media, _) = compensator();

        let err = comp
            .execute(&CompensationAction::cleanup_temp(PipelineStage::FetchMedia, ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path"));
        assert!(comp.execute(&CompensationAction::rollback_upload("  ")).await.is_err());
        assert!(comp
            .execute(&CompensationAction::delete_bq_record("vdp_gold", ""))
            .await
            .is_err());

        assert!(media.cleaned().is_empty());
        assert!(media.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_compensations_are_repeatable() {
        let (comp, _, warehouse) = compensator();
        let action = CompensationAction::delete_bq_record("vdp_gold", "youtube:a");
        comp.execute(&action).await.unwrap();
        comp.execute(&action).await.unwrap();
        assert_eq!(warehouse.count("vdp_gold", "youtube:a").await.unwrap(), 0);
    }
}
