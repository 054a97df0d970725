/// Image and avatar resolution with an in-memory cache
use crate::chat_types::ImageRef;
use crate::collaborators::ResourceStore;
use crate::error::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct MediaResolver {
    store: Arc<dyn ResourceStore>,
    cache: RwLock<HashMap<String, Bytes>>,
}

impl MediaResolver {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Blob of an image message; `None` when the resource is gone
    pub async fn image(&self, image: &ImageRef) -> Result<Option<Bytes>> {
        self.resource(&image.resource_id).await
    }

    /// Avatar picture of a user's profile. Users without one resolve to `None`.
    pub async fn avatar(&self, image_id: Option<&str>) -> Result<Option<Bytes>> {
        match image_id {
            Some(id) => self.resource(id).await,
            None => Ok(None),
        }
    }

    /// Upload an image and return a reference ready to send
    pub async fn upload_image(&self, data: Bytes, file_name: &str, width: u32, height: u32) -> Result<ImageRef> {
        let resource_id = self.store.upload(data.clone(), file_name).await?;
        self.cache.write().await.insert(resource_id.clone(), data);
        Ok(ImageRef {
            resource_id,
            width,
            height,
        })
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn resource(&self, id: &str) -> Result<Option<Bytes>> {
        if let Some(data) = self.cache.read().await.get(id) {
            return Ok(Some(data.clone()));
        }

        let Some(data) = self.store.download(id).await? else {
            debug!("Resource {} not found", id);
            return Ok(None);
        };
        self.cache.write().await.insert(id.to_string(), data.clone());
        Ok(Some(data))
    }
}
