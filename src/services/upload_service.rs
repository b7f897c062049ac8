use std::path::{Path, PathBuf};

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::media::MediaFile;

pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mp3", "png", "jpg", "jpeg", "gif", "svg", "pdf"];
pub const TEMPLATE_EXTENSIONS: &[&str] = &["pdf"];

/// Lower-cased extension of `filename` if it is in `allowed`.
pub fn sanitize_extension(filename: &str, allowed: &[&str]) -> Option<String> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())?;
    allowed.contains(&ext.as_str()).then_some(ext)
}

#[derive(Clone)]
pub struct UploadService {
    pool: PgPool,
    root: PathBuf,
}

pub struct StoredFile {
    /// Path under the uploads root, e.g. `media/<uuid>.mp4`.
    pub relative_path: String,
    pub public_url: String,
    pub size_bytes: i64,
}

impl UploadService {
    pub fn new(pool: PgPool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `data` under `<root>/<subdir>/<uuid>.<ext>`.
    pub async fn store(
        &self,
        subdir: &str,
        filename: &str,
        data: &[u8],
        allowed: &[&str],
    ) -> Result<StoredFile> {
        if data.is_empty() {
            return Err(Error::BadRequest("Uploaded file is empty".to_string()));
        }
        let ext = sanitize_extension(filename, allowed).ok_or_else(|| {
            Error::BadRequest(format!(
                "File type not allowed. Allowed: {}",
                allowed.join(", ")
            ))
        })?;

        let dir = self.root.join(subdir);
        tokio::fs::create_dir_all(&dir).await?;
        let saved = format!("{}.{}", Uuid::new_v4(), ext);
        tokio::fs::write(dir.join(&saved), data).await?;

        let relative_path = format!("{}/{}", subdir, saved);
        tracing::info!(path = %relative_path, bytes = data.len(), "file stored");
        Ok(StoredFile {
            public_url: format!("/uploads/{}", relative_path),
            relative_path,
            size_bytes: data.len() as i64,
        })
    }

    pub async fn save_media(
        &self,
        filename: &str,
        content_type: Option<String>,
        data: &[u8],
        uploaded_by: Uuid,
    ) -> Result<MediaFile> {
        let stored = self.store("media", filename, data, MEDIA_EXTENSIONS).await?;
        let media = sqlx::query_as::<_, MediaFile>(
            r#"INSERT INTO media_files (original_name, file_path, content_type, size_bytes, uploaded_by)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(filename)
        .bind(&stored.public_url)
        .bind(content_type)
        .bind(stored.size_bytes)
        .bind(uploaded_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(media)
    }

    pub async fn list_media(&self, limit: i64) -> Result<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFile>(
            r#"SELECT * FROM media_files ORDER BY created_at DESC LIMIT $1"#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Resolves a stored relative path back to disk, refusing anything that
    /// would escape the uploads root.
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let clean = relative_path.trim_start_matches("/uploads/");
        if Path::new(clean)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::BadRequest("Invalid file path".to_string()));
        }
        Ok(self.root.join(clean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_checked_case_insensitively() {
        assert_eq!(sanitize_extension("Intro.MP4", MEDIA_EXTENSIONS).as_deref(), Some("mp4"));
        assert_eq!(sanitize_extension("cert.pdf", TEMPLATE_EXTENSIONS).as_deref(), Some("pdf"));
        assert!(sanitize_extension("script.sh", MEDIA_EXTENSIONS).is_none());
        assert!(sanitize_extension("noext", MEDIA_EXTENSIONS).is_none());
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let svc = UploadService::new(pool, "/srv/uploads");
        assert_eq!(
            svc.resolve("/uploads/templates/a.pdf").unwrap(),
            PathBuf::from("/srv/uploads/templates/a.pdf")
        );
        assert!(svc.resolve("../etc/passwd").is_err());
        assert!(svc.resolve("/etc/passwd").is_err());
    }
}
