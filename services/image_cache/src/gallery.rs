//! Gallery view model
//!
//! Main-domain state shown to the user. Every member of [`Gallery`] inherits
//! main isolation, and results are published in one batched main-domain
//! continuation so no observer sees a half-updated gallery.

use crate::downloader::Image;

use isolation_runtime::{Domain, IsolatedType, Isolation, Operation, Result, Runtime};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// One image shown in the gallery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub key: String,
    pub size: usize,
}

#[derive(Debug, Default)]
struct GalleryState {
    tiles: Vec<Tile>,
    errors: Vec<String>,
    revision: u64,
}

/// What one publish changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub revision: u64,
    pub tiles: usize,
    pub errors: usize,
    /// Name of the thread the batch ran on
    pub thread: Option<String>,
}

pub struct Gallery {
    state: Arc<Mutex<GalleryState>>,
    publish: Operation,
}

impl IsolatedType for Gallery {
    fn isolation() -> Isolation {
        Isolation::Main
    }
}

impl Gallery {
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(GalleryState::default())),
            publish: runtime.declare_member::<Gallery>("gallery.publish")?,
        })
    }

    /// Domain the gallery's state belongs to
    pub fn domain(&self) -> &Domain {
        self.publish.domain()
    }

    /// Replace the gallery contents with `results` in one main-domain batch
    pub async fn publish(&self, results: Vec<(String, Result<Image>)>) -> Result<PublishSummary> {
        let state = Arc::clone(&self.state);
        let domain = self.domain().clone();

        self.publish
            .run(move || {
                domain.check_current("gallery state")?;

                let mut state = state.lock();
                state.tiles.clear();
                state.errors.clear();
                for (key, result) in results {
                    match result {
                        Ok(image) => state.tiles.push(Tile {
                            size: image.size(),
                            key: image.key,
                        }),
                        Err(e) => state.errors.push(format!("{}: {}", key, e)),
                    }
                }
                state.tiles.sort_by(|a, b| a.key.cmp(&b.key));
                state.tiles.dedup_by(|a, b| a.key == b.key);
                state.revision += 1;

                let summary = PublishSummary {
                    revision: state.revision,
                    tiles: state.tiles.len(),
                    errors: state.errors.len(),
                    thread: std::thread::current().name().map(str::to_string),
                };
                info!(
                    revision = summary.revision,
                    tiles = summary.tiles,
                    errors = summary.errors,
                    "Gallery published"
                );
                Ok(summary)
            })
            .await?
    }

    /// Current tiles, read on the main domain
    pub async fn tiles(&self) -> Result<Vec<Tile>> {
        let state = Arc::clone(&self.state);
        let domain = self.domain().clone();
        self.publish
            .run(move || {
                domain.check_current("gallery state")?;
                Ok(state.lock().tiles.clone())
            })
            .await?
    }

    pub async fn errors(&self) -> Result<Vec<String>> {
        let state = Arc::clone(&self.state);
        let domain = self.domain().clone();
        self.publish
            .run(move || {
                domain.check_current("gallery state")?;
                Ok(state.lock().errors.clone())
            })
            .await?
    }
}
