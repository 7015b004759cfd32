pub mod writer;

use bytes::Bytes;
use common::config::AwsConfig;
use common::{Error, Result};
use dashmap::DashMap;
use datafusion::execution::context::SessionContext;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A resolved storage location: a URL for the query engine plus the object
/// path inside the store that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    url: Url,
    path: ObjectPath,
}

impl Location {
    /// Parses `s3://`, `s3a://`, `s3n://` and `file://` URLs, or a local path.
    /// Relative local paths are resolved against the working directory.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidLocation("location must not be empty".to_string()));
        }

        let url = if raw.contains("://") {
            let mut url = Url::parse(raw)?;
            match url.scheme() {
                "s3" | "file" => {}
                "s3a" | "s3n" => {
                    url.set_scheme("s3").map_err(|_| {
                        Error::InvalidLocation(format!("Cannot normalise scheme of '{}'", raw))
                    })?;
                }
                other => {
                    return Err(Error::InvalidLocation(format!(
                        "Unsupported scheme '{}' in '{}'",
                        other, raw
                    )));
                }
            }
            if url.scheme() == "s3" && url.host_str().map_or(true, str::is_empty) {
                return Err(Error::InvalidLocation(format!("'{}' has no bucket", raw)));
            }
            url
        } else {
            let absolute = std::path::absolute(raw)?;
            Url::from_file_path(&absolute).map_err(|_| {
                Error::InvalidLocation(format!("'{}' is not a valid local path", raw))
            })?
        };

        let path = ObjectPath::from_url_path(url.path()).map_err(object_store::Error::from)?;
        Ok(Self { url, path })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Location of a direct child segment. The segment is the literal object
    /// name; it is percent-encoded in the URL and kept verbatim in the path.
    pub fn child(&self, segment: &str) -> Result<Self> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidLocation(format!("{} cannot have children", self.url)))?
            .pop_if_empty()
            .push(segment);
        let path = ObjectPath::from_url_path(url.path()).map_err(object_store::Error::from)?;
        Ok(Self { url, path })
    }

    /// URL with a trailing slash so DataFusion lists it as a directory.
    pub fn directory_url(&self) -> String {
        format!("{}/", self.url.as_str().trim_end_matches('/'))
    }

    /// Key identifying the object store serving this location, e.g. `s3://bucket`.
    pub fn store_key(&self) -> String {
        format!("{}://{}", self.url.scheme(), self.url.host_str().unwrap_or(""))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Builds and caches object stores per bucket, and wraps the handful of
/// object operations the pipeline needs.
pub struct StoreRegistry {
    aws: AwsConfig,
    stores: DashMap<String, Arc<dyn ObjectStore>>,
}

impl StoreRegistry {
    pub fn new(aws: AwsConfig) -> Self {
        Self {
            aws,
            stores: DashMap::new(),
        }
    }

    pub fn store_for(&self, location: &Location) -> Result<Arc<dyn ObjectStore>> {
        let key = location.store_key();
        if let Some(store) = self.stores.get(&key) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match location.url().scheme() {
            "file" => Arc::new(LocalFileSystem::new()),
            "s3" => Arc::new(self.build_s3(location)?),
            other => {
                return Err(Error::InvalidLocation(format!(
                    "No object store for scheme '{}'",
                    other
                )));
            }
        };

        self.stores.insert(key, store.clone());
        Ok(store)
    }

    fn build_s3(&self, location: &Location) -> Result<object_store::aws::AmazonS3> {
        let bucket = location
            .url()
            .host_str()
            .ok_or_else(|| Error::InvalidLocation(format!("'{}' has no bucket", location)))?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(key) = self.aws.access_key_id() {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = self.aws.secret_access_key() {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(region) = self.aws.region() {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = self.aws.endpoint() {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        Ok(builder.build()?)
    }

    /// Makes the store behind `location` visible to DataFusion table scans.
    pub fn register_with(&self, ctx: &SessionContext, location: &Location) -> Result<()> {
        let store = self.store_for(location)?;
        let url = Url::parse(&location.store_key())?;
        ctx.runtime_env().register_object_store(&url, store);
        Ok(())
    }

    /// Lists objects under `location`, recursively, sorted by path. A location
    /// naming a single object yields just that object.
    pub async fn list_files(&self, location: &Location, extension: &str) -> Result<Vec<ObjectMeta>> {
        let store = self.store_for(location)?;

        if !location.path().as_ref().is_empty() {
            match store.head(location.path()).await {
                Ok(meta) => return Ok(vec![meta]),
                Err(object_store::Error::NotFound { .. }) => {}
                // local directories report as errors other than NotFound on head
                Err(e) => debug!(location = %location, error = %e, "Head failed, listing as prefix"),
            }
        }

        let listed: Vec<ObjectMeta> = match store.list(Some(location.path())).try_collect::<Vec<_>>().await {
            Ok(listed) => listed,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<ObjectMeta> = listed
            .into_iter()
            .filter(|meta| meta.location.as_ref().ends_with(extension))
            .collect();
        files.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(files)
    }

    /// Deletes every object under `location`. Returns the number removed.
    pub async fn delete_prefix(&self, location: &Location) -> Result<usize> {
        let store = self.store_for(location)?;
        let listed: Vec<ObjectMeta> = match store.list(Some(location.path())).try_collect::<Vec<_>>().await {
            Ok(listed) => listed,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for meta in &listed {
            store.delete(&meta.location).await?;
        }
        Ok(listed.len())
    }

    pub async fn put(&self, location: &Location, data: Vec<u8>) -> Result<()> {
        let store = self.store_for(location)?;
        store.put(location.path(), data.into()).await?;
        Ok(())
    }

    pub async fn get(&self, location: &Location) -> Result<Bytes> {
        let store = self.store_for(location)?;
        Ok(store.get(location.path()).await?.bytes().await?)
    }

    /// Reads an object, mapping a missing object to `None`.
    pub async fn get_opt(&self, location: &Location) -> Result<Option<Bytes>> {
        match self.get(location).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::ObjectStore(object_store::Error::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads an object by its store path, as returned from [`list_files`](Self::list_files).
    pub async fn get_path(&self, location: &Location, path: &ObjectPath) -> Result<Bytes> {
        let store = self.store_for(location)?;
        Ok(store.get(path).await?.bytes().await?)
    }
}
