//! Wiring from environment configuration to pipeline components.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use tally_core::{
    AttachmentWithInvoices, ConfigReport, InvoiceStore, MonitoringSink, PipelineConfig,
    ProcessingStatus, RecentWindow,
};
use tally_db::StorageConfig;
use tally_inference::{OpenAIConfig, OpenAiExtractor};
use tally_jobs::{
    FanoutSink, FileWatermarkStore, HttpMailboxSource, MailboxConfig, RunController, Scheduler,
    TracingSink, WebhookSink,
};

use crate::cli::RunArgs;

/// Print a value as pretty JSON on stdout.
pub fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn pipeline_config() -> anyhow::Result<PipelineConfig> {
    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    let report = config.validate();
    for warning in &report.warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    if !report.is_ok() {
        bail!("Invalid pipeline configuration: {}", report.errors.join("; "));
    }
    Ok(config)
}

async fn store() -> anyhow::Result<Arc<dyn InvoiceStore>> {
    let storage = StorageConfig::from_env().context("Invalid storage configuration")?;
    tally_db::connect(&storage)
        .await
        .context("Failed to open invoice store")
}

fn sink(config: &PipelineConfig) -> anyhow::Result<Arc<dyn MonitoringSink>> {
    let mut fanout = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(url) = &config.monitoring_webhook_url {
        let webhook = WebhookSink::new(url.clone(), config.monitoring_webhook_secret.clone())?;
        fanout = fanout.with(Arc::new(webhook));
    }
    Ok(Arc::new(fanout))
}

async fn controller(config: PipelineConfig) -> anyhow::Result<RunController> {
    let source = HttpMailboxSource::from_env().context("Invalid mailbox configuration")?;
    let extractor =
        tally_inference::extractor_from_env().context("Invalid extraction configuration")?;
    let store = store().await?;
    let sink = sink(&config)?;
    Ok(RunController::new(
        Arc::new(source),
        extractor,
        store,
        sink,
        config,
    ))
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = pipeline_config()?;
    let intent = args.intent(&config.search);
    let controller = controller(config).await?;
    let report = controller.run_detailed(&intent, args.mode()).await?;
    emit(&report)
}

pub async fn schedule(now: bool) -> anyhow::Result<()> {
    let config = pipeline_config()?;
    let watermarks = Arc::new(FileWatermarkStore::new(config.watermark_path.clone()));
    let controller = Arc::new(controller(config).await?);
    let scheduler = Scheduler::new(controller, watermarks);

    if now {
        let report = scheduler.run_once(Utc::now()).await?;
        return emit(&report);
    }

    info!(
        run_at = %scheduler.schedule().run_at,
        weekdays_only = scheduler.schedule().weekdays_only,
        "Starting scheduler"
    );
    let handle = scheduler.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    handle.shutdown().await?;
    Ok(())
}

pub async fn recent(days: i64, status: Option<ProcessingStatus>, limit: i64) -> anyhow::Result<()> {
    let store = store().await?;
    let mut window = RecentWindow::last_days(days).with_limit(limit);
    if let Some(status) = status {
        window = window.with_status(status);
    }
    let records = store.query_recent(window).await?;
    emit(&records)
}

pub async fn show(id: Uuid) -> anyhow::Result<()> {
    let store = store().await?;
    let Some(attachment) = store.get_attachment_record(id).await? else {
        bail!("Attachment record {} not found", id);
    };
    let invoices = store.list_invoice_records(id).await?;
    emit(&AttachmentWithInvoices {
        attachment,
        invoices,
    })
}

#[derive(Serialize)]
struct CheckReport {
    ok: bool,
    pipeline: Option<PipelineConfig>,
    validation: ConfigReport,
    storage: serde_json::Value,
    extraction: serde_json::Value,
    mailbox: serde_json::Value,
}

/// Returns whether the configuration is usable.
pub async fn check_config(ping: bool) -> anyhow::Result<bool> {
    let mut validation = ConfigReport::default();

    let pipeline = match PipelineConfig::from_env() {
        Ok(config) => {
            let report = config.validate();
            validation.errors.extend(report.errors);
            validation.warnings.extend(report.warnings);
            Some(config)
        }
        Err(e) => {
            validation.errors.push(e.to_string());
            None
        }
    };

    let storage = match StorageConfig::from_env() {
        Ok(storage) => {
            let mut out = json!({
                "backend": storage.backend.kind(),
                "location": storage.backend.redacted_location(),
                "max_connections": storage.pool.max_connections,
            });
            if ping {
                let health = match tally_db::connect(&storage).await {
                    Ok(store) => store.health_check().await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = &health {
                    validation.errors.push(format!("storage unreachable: {}", e));
                }
                out["reachable"] = json!(health.is_ok());
            }
            out
        }
        Err(e) => {
            validation.errors.push(e.to_string());
            json!(null)
        }
    };

    let openai = OpenAIConfig::from_env();
    let mut extraction = json!({
        "base_url": openai.base_url,
        "model": openai.gen_model,
        "api_key_set": openai.api_key.is_some(),
        "pattern_fallback": openai.pattern_fallback,
        "pdftotext": tally_inference::pdftotext_available().await,
    });
    if ping {
        let reachable = match OpenAiExtractor::new(openai) {
            Ok(extractor) => extractor.health_check().await.unwrap_or(false),
            Err(_) => false,
        };
        if !reachable {
            validation
                .errors
                .push("extraction model endpoint unreachable".to_string());
        }
        extraction["reachable"] = json!(reachable);
    }

    let mailbox = match MailboxConfig::from_env() {
        Ok(config) => json!({
            "base_url": config.base_url,
            "api_key_set": config.api_key.is_some(),
            "timeout_seconds": config.timeout_seconds,
        }),
        Err(e) => {
            validation.errors.push(e.to_string());
            json!(null)
        }
    };

    let ok = validation.is_ok();
    emit(&CheckReport {
        ok,
        pipeline,
        validation,
        storage,
        extraction,
        mailbox,
    })?;
    Ok(ok)
}
