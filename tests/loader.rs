use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use image::{ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

use oximage::ImageContext;
use oximage::domain::entities::{ImageResource, ImageSource};
use oximage::domain::errors::{LoadError, TransportError};
use oximage::domain::ports::{FetchRequest, TransportPort, TransportResponse};
use oximage::infrastructure::config::EngineConfig;
use oximage::infrastructure::image::LoadOptions;
use oximage::infrastructure::system::FixedMemoryProbe;

struct FakeOrigin {
    body: Bytes,
    delay: Duration,
    opens: AtomicUsize,
}

impl FakeOrigin {
    fn new(body: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from(body),
            delay,
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportPort for FakeOrigin {
    async fn open(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if request.url.ends_with("/missing.png") {
            return Err(TransportError::status(404));
        }
        let delay = self.delay;
        let chunks: Vec<Bytes> = self.body.chunks(64).map(Bytes::copy_from_slice).collect();
        let body = stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok(chunk)
            })
            .boxed();
        Ok(TransportResponse {
            expected_size: Some(self.body.len() as u64),
            body,
        })
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let buffer = RgbaImage::from_pixel(width, height, Rgba([12, 34, 56, 255]));
    let mut out = Cursor::new(Vec::new());
    buffer.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

async fn engine(dir: &TempDir, origin: Arc<FakeOrigin>) -> ImageContext {
    let mut config = EngineConfig::default();
    config.disk.path = Some(dir.path().join("cache"));
    config.pool.workers = Some(2);
    let probe = Arc::new(FixedMemoryProbe::new(1 << 30, 1 << 30));
    ImageContext::with_parts(config, origin, probe, None)
        .await
        .unwrap()
}

async fn wait_for_disk(context: &ImageContext, resource: &ImageResource) {
    let disk = context.disk_cache().unwrap();
    for _ in 0..400 {
        if disk.contains(&resource.source_key()).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("disk write never landed");
}

#[tokio::test]
async fn test_tiers_network_then_memory_then_disk() {
    let dir = TempDir::new().unwrap();
    let origin = FakeOrigin::new(png(16, 9), Duration::ZERO);
    let context = engine(&dir, origin.clone()).await;
    let resource = ImageResource::parse("https://img.test/cat.png");
    let loader = context.loader();

    let first = assert_ok!(loader.fetch(&resource, LoadOptions::default(), None, None).await);
    assert_eq!(first.source, ImageSource::Network);
    assert_eq!((first.image.width(), first.image.height()), (16, 9));
    wait_for_disk(&context, &resource).await;

    let second = assert_ok!(loader.fetch(&resource, LoadOptions::default(), None, None).await);
    assert_eq!(second.source, ImageSource::MemoryCache);
    assert!(second.data.is_none());

    context.memory_cache().remove_all();
    let third = assert_ok!(loader.fetch(&resource, LoadOptions::default(), None, None).await);
    assert_eq!(third.source, ImageSource::DiskCache);
    assert!(third.data.is_some());
    assert_eq!(origin.opens(), 1);
}

#[tokio::test]
async fn test_memory_only_miss_does_not_touch_origin() {
    let dir = TempDir::new().unwrap();
    let origin = FakeOrigin::new(png(2, 2), Duration::ZERO);
    let context = engine(&dir, origin.clone()).await;
    let options = LoadOptions {
        memory_only: true,
        ..LoadOptions::default()
    };

    let result = context
        .loader()
        .fetch(&ImageResource::parse("https://img.test/a.png"), options, None, None)
        .await;

    assert!(matches!(assert_err!(result), LoadError::NotCached));
    assert_eq!(origin.opens(), 0);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_download() {
    let dir = TempDir::new().unwrap();
    let origin = FakeOrigin::new(png(32, 32), Duration::from_millis(20));
    let context = engine(&dir, origin.clone()).await;
    let resource = ImageResource::parse("https://img.test/shared.png");

    let mut receivers = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let (tx, rx) = oneshot::channel();
        tasks.push(context.loader().load(
            resource.clone(),
            LoadOptions {
                progressive: false,
                ..LoadOptions::default()
            },
            None,
            None,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        ));
        receivers.push(rx);
    }

    for rx in receivers {
        let loaded = assert_ok!(rx.await.unwrap());
        assert_eq!(loaded.image.width(), 32);
    }
    assert_eq!(origin.opens(), 1);
    assert_eq!(context.coordinator().stats().coalesced_requests, 3);
}

#[tokio::test]
async fn test_transport_failure_reaches_caller_and_caches_nothing() {
    let dir = TempDir::new().unwrap();
    let origin = FakeOrigin::new(Vec::new(), Duration::ZERO);
    let context = engine(&dir, origin).await;
    let resource = ImageResource::parse("https://img.test/missing.png");

    let result = context
        .loader()
        .fetch(&resource, LoadOptions::default(), None, None)
        .await;

    assert!(matches!(
        assert_err!(result),
        LoadError::Transport(TransportError::Status { status: 404 })
    ));
    assert!(context.memory_cache().is_empty());
    assert!(context.disk_cache().unwrap().is_empty().await);
}
