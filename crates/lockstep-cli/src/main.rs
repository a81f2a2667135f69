use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, sleep};
use tracing::info;

use lockstep_core::domain::{HandlerError, Job, JobKind, SessionError, TenantId};
use lockstep_core::impls::{FanoutEventSink, RecordingEventSink, TracingEventSink};
use lockstep_core::ports::SessionFactory;
use lockstep_core::{EngineBuilder, EngineConfig, JobContext, JobEventKind, JobHandler};

/// Stand-in for an authenticated remote session (browser, API login, ...).
#[derive(Debug, Clone)]
struct SimSession {
    id: u64,
    tenant: TenantId,
}

/// Logging in is slow; that is what the pool saves us from repeating.
#[derive(Default)]
struct SimFactory {
    next_id: AtomicU64,
}

#[async_trait]
impl SessionFactory for SimFactory {
    type Session = SimSession;

    async fn create(&self, tenant: &TenantId) -> Result<SimSession, SessionError> {
        sleep(Duration::from_millis(300)).await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(%tenant, session = id, "logged in");
        Ok(SimSession {
            id,
            tenant: tenant.clone(),
        })
    }

    async fn validate(&self, _session: &SimSession) -> bool {
        sleep(Duration::from_millis(10)).await;
        true
    }

    async fn destroy(&self, session: SimSession) {
        info!(tenant = %session.tenant, session = session.id, "logged out");
    }
}

#[derive(Debug, Deserialize)]
struct ExportPayload {
    pages: u8,
    #[serde(default)]
    fail: bool,
}

/// Walks through `pages` pages of a report, reporting progress per page.
struct ExportReport;

#[async_trait]
impl JobHandler<SimSession> for ExportReport {
    async fn execute(
        &self,
        session: SimSession,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let p: ExportPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::failed(format!("json decode: {e}")))?;

        for page in 1..=p.pages {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            sleep(Duration::from_millis(100)).await;
            let percent = (u16::from(page) * 100 / u16::from(p.pages.max(1))) as u8;
            ctx.report(percent, format!("page {page}/{}", p.pages)).await;
        }

        if p.fail {
            return Err(HandlerError::failed("remote rejected the export"));
        }
        Ok(serde_json::json!({ "session": session.id, "pages": p.pages }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    lockstep_core::observability::init();

    // (A) 設定は LOCKSTEP_* 環境変数から（未指定ならデフォルト）
    let config = EngineConfig::from_env()?;
    let recorder = Arc::new(RecordingEventSink::new());
    let sink = FanoutEventSink::new()
        .with(Arc::new(TracingEventSink))
        .with(recorder.clone());

    // (B) エンジンを組み立てる（handler 不足は build 時に落とす）
    let engine = EngineBuilder::new(SimFactory::default())
        .config(config)
        .event_sink(Arc::new(sink))
        .register("report.export", ExportReport)?
        .expect_kinds(&["report.export"])
        .build()?;
    let workers = engine.start();

    // (C) 3 テナント分のジョブを投入。同じテナントのジョブは直列に流れる
    let jobs = [
        ("agent-a", serde_json::json!({ "pages": 3 })),
        ("agent-a", serde_json::json!({ "pages": 2 })),
        ("agent-b", serde_json::json!({ "pages": 4 })),
        ("agent-c", serde_json::json!({ "pages": 1, "fail": true })),
        ("agent-b", serde_json::json!({ "pages": 1 })),
    ];
    for (tenant, payload) in &jobs {
        let job = Job::new(
            TenantId::new(*tenant),
            JobKind::new("report.export"),
            payload.clone(),
        );
        let id = engine.submit(job).await?;
        info!(%id, tenant, "submitted");
    }

    // (D) 全ジョブの決着を待つ（retryable な failed はプール満杯で再投入済み）
    recorder
        .wait_until(|events| {
            events
                .iter()
                .filter(|e| match &e.event {
                    JobEventKind::Completed { .. } => true,
                    JobEventKind::Failed { retryable, .. } => !retryable,
                    _ => false,
                })
                .count()
                >= jobs.len()
        })
        .await;

    for event in recorder.events() {
        match &event.event {
            JobEventKind::Completed { result } => {
                println!("{} {} completed: {result}", event.tenant_id, event.job_id)
            }
            JobEventKind::Failed { error, retryable } => println!(
                "{} {} failed: {error} (retryable={retryable})",
                event.tenant_id, event.job_id
            ),
            _ => {}
        }
    }
    println!("pool: {:?}", engine.pool().stats());

    // (E) 新規取得を止め、実行中を待ってからセッションを全部閉じる
    engine.shutdown(workers).await;
    Ok(())
}
