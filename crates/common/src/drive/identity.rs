use std::path::Path;

use crate::crypto::{KeyError, SecretKey};

/// File under the meta dir holding the drive's identity key
pub const KEY_FILE_NAME: &str = "key.pem";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity key is invalid: {0}")]
    Key(#[from] KeyError),
}

/// Load the identity stored in `meta_path`, generating and persisting one
///  on first use.
pub async fn load_or_create_identity(meta_path: &Path) -> Result<SecretKey, IdentityError> {
    let key_path = meta_path.join(KEY_FILE_NAME);
    match tokio::fs::read_to_string(&key_path).await {
        Ok(pem) => return Ok(SecretKey::from_pem(&pem)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    tokio::fs::create_dir_all(meta_path).await?;
    let key = SecretKey::generate();
    let staged = key_path.with_extension("pem.tmp");
    tokio::fs::write(&staged, key.to_pem()).await?;
    tokio::fs::rename(&staged, &key_path).await?;
    tracing::info!("generated drive identity {}", key.public().fmt_short());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join(".drive");

        let first = load_or_create_identity(&meta).await.unwrap();
        let second = load_or_create_identity(&meta).await.unwrap();
        assert_eq!(first.public(), second.public());
        assert!(meta.join(KEY_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_builder_uses_meta_dir_key() {
        let dir = tempfile::tempdir().unwrap();
        let builder = crate::drive::DriveBuilder::new(dir.path());

        let first = builder.identity().await.unwrap();
        let stored = load_or_create_identity(&dir.path().join(crate::drive::DEFAULT_META_DIR))
            .await
            .unwrap();
        assert_eq!(first.public(), stored.public());
        assert_eq!(
            builder.identity().await.unwrap().public(),
            first.public()
        );
    }

    #[tokio::test]
    async fn test_garbage_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_FILE_NAME), "not a pem").unwrap();
        let res = load_or_create_identity(dir.path()).await;
        assert!(matches!(res, Err(IdentityError::Key(_))));
    }
}
