//! Memory pressure and foreground/background handling.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ImageContext;

/// Host lifecycle events the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The host is low on memory.
    MemoryWarning,
    /// The host moved to the background.
    EnteredBackground,
    /// The host became active again.
    BecameActive,
}

impl ImageContext {
    /// Applies a lifecycle signal to every cache, then forwards it to
    /// subscribers so playback buffers can shed frames.
    pub async fn handle_signal(&self, signal: LifecycleSignal) {
        info!(signal = ?signal, "Lifecycle signal");
        match signal {
            LifecycleSignal::MemoryWarning => {
                self.memory
                    .on_memory_warning(self.config.memory.memory_warning_retain_ratio);
                for image in self.animations.live_images() {
                    image.on_memory_warning();
                }
            }
            LifecycleSignal::EnteredBackground => {
                for image in self.animations.live_images() {
                    image.on_background();
                }
                if self.config.memory.clear_on_background {
                    self.memory.remove_all();
                }
                if let Some(disk) = &self.disk {
                    disk.trim_to_limits().await;
                }
            }
            LifecycleSignal::BecameActive => {
                for image in self.animations.live_images() {
                    image.on_foreground();
                }
            }
        }

        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    /// Receiver for forwarded lifecycle signals.
    #[must_use]
    pub fn subscribe_signals(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.signals.subscribe()
    }

    /// Spawns the periodic trim task. The first pass runs immediately.
    #[must_use]
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let memory = self.memory.clone();
        let disk = self.disk.clone();
        let period = self.config.disk.trim_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                memory.trim_to_limits();
                if let Some(disk) = &disk {
                    disk.trim_to_limits().await;
                    if !disk.is_available() {
                        warn!("Disk cache unavailable, stopping maintenance");
                        break;
                    }
                }
                debug!(
                    memory_cost = memory.total_cost(),
                    memory_count = memory.total_count(),
                    "Cache maintenance pass"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::entities::{CacheKey, DecodedImage};
    use crate::domain::ports::ImageCachePort;
    use crate::infrastructure::config::EngineConfig;
    use crate::infrastructure::image::decoder::fixtures::{gif_bytes, png_bytes};
    use crate::infrastructure::system::FixedMemoryProbe;
    use crate::infrastructure::transport::fixtures::ScriptedTransport;

    async fn build_context(dir: &TempDir, config: EngineConfig) -> ImageContext {
        let mut config = config;
        config.disk.path = Some(dir.path().join("images"));
        config.pool.workers = Some(2);
        let transport = Arc::new(ScriptedTransport::new(Vec::new(), Duration::ZERO));
        let probe = Arc::new(FixedMemoryProbe::new(1 << 30, 1 << 30));
        ImageContext::with_parts(config, transport, probe, None)
            .await
            .unwrap()
    }

    fn still(context: &ImageContext) -> DecodedImage {
        context
            .decoders()
            .decode(&Bytes::from(png_bytes(4, 4)))
            .unwrap()
    }

    fn fill_memory(context: &ImageContext, count: usize) {
        let image = still(context);
        for i in 0..count {
            context
                .cache()
                .store_memory(CacheKey::for_source(&format!("img-{i}")), image.clone());
        }
    }

    #[tokio::test]
    async fn test_memory_warning_halves_memory_and_forwards() {
        let dir = TempDir::new().unwrap();
        let context = build_context(&dir, EngineConfig::default()).await;
        let mut signals = context.subscribe_signals();
        fill_memory(&context, 10);

        context.handle_signal(LifecycleSignal::MemoryWarning).await;

        assert_eq!(context.memory_cache().total_count(), 5);
        assert_eq!(signals.recv().await.unwrap(), LifecycleSignal::MemoryWarning);
    }

    #[tokio::test]
    async fn test_background_clears_memory_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.memory.clear_on_background = true;
        let context = build_context(&dir, config).await;
        fill_memory(&context, 3);

        context.handle_signal(LifecycleSignal::EnteredBackground).await;

        assert!(context.memory_cache().is_empty());
    }

    #[tokio::test]
    async fn test_background_keeps_memory_by_default() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.memory.clear_on_background = false;
        let context = build_context(&dir, config).await;
        fill_memory(&context, 3);

        context.handle_signal(LifecycleSignal::EnteredBackground).await;

        assert_eq!(context.memory_cache().total_count(), 3);
    }

    #[tokio::test]
    async fn test_animation_signals_keep_frame_cache_within_cap() {
        let dir = TempDir::new().unwrap();
        let context = build_context(&dir, EngineConfig::default()).await;
        let decoded = context
            .decoders()
            .decode(&Bytes::from(gif_bytes(3, 4, 4, 20)))
            .unwrap();
        let key = CacheKey::for_source("anim");
        let playback = context.playback(&key, &decoded).unwrap();
        let image = playback.buffer.image().clone();

        context.handle_signal(LifecycleSignal::EnteredBackground).await;
        context.handle_signal(LifecycleSignal::MemoryWarning).await;
        assert!(image.cached_bytes() <= image.max_cache_size());

        context.handle_signal(LifecycleSignal::BecameActive).await;
        assert_eq!(image.max_cache_size(), (1usize << 30) / 5);
    }

    #[tokio::test]
    async fn test_maintenance_trims_disk_to_count() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.disk.max_count = Some(2);
        let context = build_context(&dir, config).await;
        let disk = context.disk_cache().unwrap().clone();
        for i in 0..5 {
            disk.set(CacheKey::for_source(&format!("blob-{i}")), Bytes::from(vec![i; 16]))
                .await;
        }

        let handle = context.spawn_maintenance();
        for _ in 0..200 {
            if disk.total_count().await <= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        assert_eq!(disk.total_count().await, 2);
    }
}
