use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{
    ListResult, ObjectMeta, ObjectStore, ObjectStoreScheme,
    aws::AmazonS3Builder,
    azure::MicrosoftAzureBuilder,
    gcp::GoogleCloudStorageBuilder,
    local::LocalFileSystem,
    path::Path,
    prefix::PrefixStore,
};
use url::Url;

/// A wrapper around an `ObjectStore`. There are a few things it helps us with over a plain
/// `ObjectStore`:
/// - Keeps track of the URL of the store, in case we need it.
/// - Handles relative filesystem paths and path prefixes.
/// - Can be extended with helper functions.
#[derive(Debug, Clone)]
pub struct Store {
    url: Url,
    prefix: String,
    store: Arc<PrefixStore<Arc<dyn ObjectStore>>>,
}

impl Store {
    /// Creates a store for an object store URL or filesystem directory.
    ///
    /// Examples of valid formats for `location`:
    /// - Filesystem path: `relative/path/to/data/`
    /// - GCS: `gs://bucket-name`
    /// - S3: `s3://bucket-name`
    /// - Prefixed: `s3://bucket-name/my_prefix/`
    ///
    /// Cloud providers are configured via environment variables (`AWS_*`, `GOOGLE_*`,
    /// `AZURE_*`), as supported by the corresponding `object_store` builders.
    pub fn new(location: &str) -> Result<Self, StoreError> {
        let url = infer_url(location)?;
        let unprefixed = object_store(&url)?;
        let prefix = url.path().trim_start_matches('/').to_string();
        let store = Arc::new(PrefixStore::new(unprefixed, prefix.as_str()));
        Ok(Self { url, prefix, store })
    }

    /// An in-process store backed by memory. Used in tests.
    pub fn in_memory() -> Self {
        let url = Url::parse("memory://").expect("static url must parse");
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        Self {
            url,
            prefix: String::new(),
            store: Arc::new(PrefixStore::new(store, "")),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Reads the entire contents of an object.
    pub async fn get_bytes(&self, location: &Path) -> Result<Bytes, StoreError> {
        Ok(self.store.get(location).await?.bytes().await?)
    }

    /// Writes an object, replacing any previous contents.
    pub async fn put_bytes(&self, location: &Path, bytes: Bytes) -> Result<(), StoreError> {
        self.store.put(location, bytes.into()).await?;
        Ok(())
    }

    /// Fetches an object's metadata without reading its contents.
    pub async fn head(&self, location: &Path) -> Result<ObjectMeta, StoreError> {
        Ok(self.store.head(location).await?)
    }

    pub async fn delete(&self, location: &Path) -> Result<(), StoreError> {
        self.store.delete(location).await?;
        Ok(())
    }

    /// Lists all objects under the given prefix, recursively.
    pub fn list(&self, prefix: &Path) -> BoxStream<'static, Result<ObjectMeta, StoreError>> {
        self.store
            .list(Some(prefix))
            .map_err(StoreError::from)
            .boxed()
    }

    /// Lists the store root one level deep, returning objects and common prefixes.
    pub async fn list_root(&self) -> Result<ListResult, StoreError> {
        Ok(self.store.list_with_delimiter(None).await?)
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store with prefix {}", self.prefix)
    }
}

/// Creates an object store instance for a parsed URL.
fn object_store(url: &Url) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let (scheme, _) = ObjectStoreScheme::parse(url).map_err(|_| StoreError::UnsupportedUrl {
        url: url.to_string(),
    })?;

    match scheme {
        ObjectStoreScheme::GoogleCloudStorage => {
            let store = GoogleCloudStorageBuilder::from_env()
                .with_url(url.to_string())
                .build()?;
            Ok(Arc::new(store))
        }
        ObjectStoreScheme::AmazonS3 => {
            let store = AmazonS3Builder::from_env().with_url(url.to_string()).build()?;
            Ok(Arc::new(store))
        }
        ObjectStoreScheme::MicrosoftAzure => {
            let store = MicrosoftAzureBuilder::from_env()
                .with_url(url.to_string())
                .build()?;
            Ok(Arc::new(store))
        }
        ObjectStoreScheme::Local => Ok(Arc::new(LocalFileSystem::new())),
        _ => Err(StoreError::UnsupportedUrl {
            url: url.to_string(),
        }),
    }
}

fn infer_url(location: &str) -> Result<Url, StoreError> {
    let mut location = location.to_string();
    if !location.ends_with('/') {
        location.push('/');
    }

    match Url::parse(&location) {
        Ok(url) => Ok(url),

        // If the location is not a URL, it may still be a filesystem path.
        Err(_) => {
            let path =
                fs_err::canonicalize(&location).map_err(|_| StoreError::UnsupportedUrl {
                    url: location.clone(),
                })?;
            Url::from_directory_path(&path).map_err(|_| StoreError::UnsupportedUrl {
                url: location.clone(),
            })
        }
    }
}

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The location does not name a supported object store.
    #[error("unsupported object store url: {url}")]
    UnsupportedUrl { url: String },

    /// Runtime error from the underlying object store implementation.
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = Store::in_memory();
        let location = Path::from("t1/object");

        store
            .put_bytes(&location, Bytes::from_static(b"contents"))
            .await
            .unwrap();
        assert_eq!(store.get_bytes(&location).await.unwrap().as_ref(), b"contents");

        store.delete(&location).await.unwrap();
        let err = store.get_bytes(&location).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_root_returns_first_level_prefixes() {
        let store = Store::in_memory();
        for key in ["t1/a/meta.json", "t1/b/meta.json", "t2/index.json.gz"] {
            store
                .put_bytes(&Path::from(key), Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        let listing = store.list_root().await.unwrap();
        let prefixes: Vec<String> = listing
            .common_prefixes
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(prefixes, vec!["t1".to_string(), "t2".to_string()]);
    }
}
