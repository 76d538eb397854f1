//! Schema bootstrap for the relational backends.
//!
//! Tables are created idempotently at connect time. The foreign key forbids
//! orphan invoices; the composite unique key forbids duplicate sequences.

use sqlx::{PgPool, SqlitePool};
use tracing::info;

use tally_core::{Error, Result};

const PG_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS attachment_record (
        id UUID PRIMARY KEY,
        message_id TEXT NOT NULL,
        attachment_id TEXT NOT NULL,
        attachment_name TEXT NOT NULL,
        sender_email TEXT NOT NULL,
        subject TEXT NOT NULL,
        content_type TEXT NOT NULL,
        file_size_bytes BIGINT NOT NULL,
        confidence_score DOUBLE PRECISION NOT NULL
            CHECK (confidence_score >= 0 AND confidence_score <= 1),
        extracted_data JSONB,
        processing_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (processing_status IN ('pending', 'completed', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (message_id, attachment_name)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_attachment_record_created_at
        ON attachment_record (created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS invoice_record (
        id UUID PRIMARY KEY,
        attachment_record_id UUID NOT NULL
            REFERENCES attachment_record (id) ON DELETE RESTRICT,
        invoice_number TEXT,
        vendor_name TEXT,
        vendor_address TEXT,
        invoice_date DATE,
        due_date DATE,
        total_amount DOUBLE PRECISION,
        subtotal_amount DOUBLE PRECISION,
        tax_amount DOUBLE PRECISION,
        currency TEXT,
        line_items JSONB NOT NULL DEFAULT '[]'::jsonb,
        bill_to_name TEXT,
        payment_terms TEXT,
        purchase_order_number TEXT,
        confidence_score DOUBLE PRECISION NOT NULL
            CHECK (confidence_score >= 0 AND confidence_score <= 1),
        invoice_sequence INTEGER NOT NULL CHECK (invoice_sequence >= 1),
        extraction_method TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (attachment_record_id, invoice_sequence)
    )"#,
];

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS attachment_record (
        id BLOB PRIMARY KEY,
        message_id TEXT NOT NULL,
        attachment_id TEXT NOT NULL,
        attachment_name TEXT NOT NULL,
        sender_email TEXT NOT NULL,
        subject TEXT NOT NULL,
        content_type TEXT NOT NULL,
        file_size_bytes INTEGER NOT NULL,
        confidence_score REAL NOT NULL
            CHECK (confidence_score >= 0 AND confidence_score <= 1),
        extracted_data TEXT,
        processing_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (processing_status IN ('pending', 'completed', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (message_id, attachment_name)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_attachment_record_created_at
        ON attachment_record (created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS invoice_record (
        id BLOB PRIMARY KEY,
        attachment_record_id BLOB NOT NULL
            REFERENCES attachment_record (id) ON DELETE RESTRICT,
        invoice_number TEXT,
        vendor_name TEXT,
        vendor_address TEXT,
        invoice_date TEXT,
        due_date TEXT,
        total_amount REAL,
        subtotal_amount REAL,
        tax_amount REAL,
        currency TEXT,
        line_items TEXT NOT NULL DEFAULT '[]',
        bill_to_name TEXT,
        payment_terms TEXT,
        purchase_order_number TEXT,
        confidence_score REAL NOT NULL
            CHECK (confidence_score >= 0 AND confidence_score <= 1),
        invoice_sequence INTEGER NOT NULL CHECK (invoice_sequence >= 1),
        extraction_method TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (attachment_record_id, invoice_sequence)
    )"#,
];

/// Create tables and indexes on PostgreSQL if missing.
pub async fn ensure_pg_schema(pool: &PgPool) -> Result<()> {
    for statement in PG_SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
    }
    info!(
        subsystem = "database",
        component = "schema",
        op = "ensure",
        backend = "postgresql",
        statements = PG_SCHEMA.len(),
        "Schema ready"
    );
    Ok(())
}

/// Create tables and indexes on SQLite if missing.
pub async fn ensure_sqlite_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SQLITE_SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
    }
    info!(
        subsystem = "database",
        component = "schema",
        op = "ensure",
        backend = "sqlite",
        statements = SQLITE_SCHEMA.len(),
        "Schema ready"
    );
    Ok(())
}
