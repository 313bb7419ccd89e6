//! Video and image asset rows.
//!
//! The two tables share a shape; `AssetKind` picks the table. Deleting an
//! asset cascades to its operations (the only delete path for those).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use vf_schemas::AssetKind;

#[derive(Debug, Clone)]
pub struct AssetRow {
    pub asset_id: Uuid,
    pub kind: AssetKind,
    pub user_id: Uuid,
    pub name: String,
    pub format: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub size_bytes: i64,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl AssetRow {
    /// Known source dimensions, when both are present.
    pub fn dims(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as u32, h as u32)),
            _ => None,
        }
    }

    /// Path of the original upload under the storage root:
    /// `<root>/<asset_id>/original.<format>`.
    pub fn source_path(&self, storage_root: &str) -> std::path::PathBuf {
        std::path::Path::new(storage_root)
            .join(self.asset_id.to_string())
            .join(format!("original.{}", self.format))
    }

    /// Directory derivatives are written into.
    pub fn derived_dir(&self, storage_root: &str) -> std::path::PathBuf {
        std::path::Path::new(storage_root).join(self.asset_id.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub asset_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub format: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub size_bytes: i64,
    pub metadata: Value,
}

fn table(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => "videos",
        AssetKind::Image => "images",
    }
}

fn id_col(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => "video_id",
        AssetKind::Image => "image_id",
    }
}

pub async fn insert_video(pool: &PgPool, asset: &NewAsset) -> Result<()> {
    insert_asset(pool, AssetKind::Video, asset).await
}

pub async fn insert_image(pool: &PgPool, asset: &NewAsset) -> Result<()> {
    insert_asset(pool, AssetKind::Image, asset).await
}

async fn insert_asset(pool: &PgPool, kind: AssetKind, asset: &NewAsset) -> Result<()> {
    let sql = format!(
        r#"
        insert into {table} ({id}, user_id, name, format, width, height, size_bytes, metadata)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
        table = table(kind),
        id = id_col(kind),
    );

    sqlx::query(&sql)
        .bind(asset.asset_id)
        .bind(asset.user_id)
        .bind(&asset.name)
        .bind(&asset.format)
        .bind(asset.width)
        .bind(asset.height)
        .bind(asset.size_bytes)
        .bind(&asset.metadata)
        .execute(pool)
        .await
        .with_context(|| format!("insert_asset ({}) failed", kind.as_str()))?;

    Ok(())
}

pub async fn fetch_asset(
    pool: &PgPool,
    kind: AssetKind,
    asset_id: Uuid,
) -> Result<Option<AssetRow>> {
    let sql = format!(
        r#"
        select {id} as asset_id, user_id, name, format, width, height,
               size_bytes, metadata, created_at
        from {table}
        where {id} = $1
        "#,
        table = table(kind),
        id = id_col(kind),
    );

    let row = sqlx::query(&sql)
        .bind(asset_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("fetch_asset ({}) failed", kind.as_str()))?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(AssetRow {
        asset_id: row.try_get("asset_id")?,
        kind,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        format: row.try_get("format")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        size_bytes: row.try_get("size_bytes")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    }))
}
