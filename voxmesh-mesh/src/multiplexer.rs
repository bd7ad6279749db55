//! The four local sources of a participant and their mapping onto links.
//!
//! New links receive every active source in the fixed attach order before
//! their first offer. Broadcasts fan out over every live link concurrently
//! and report per-link results so the caller decides which links to
//! renegotiate.

use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};
use voxmesh_core::models::TrackKind;
use voxmesh_core::{LocalTrack, Result};

use crate::link::PeerLink;

#[derive(Default)]
pub struct TrackMultiplexer {
    slots: RwLock<[Option<LocalTrack>; 4]>,
}

impl TrackMultiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.slots.read()[kind.index()].clone()
    }

    #[must_use]
    pub fn is_active(&self, kind: TrackKind) -> bool {
        self.slots.read()[kind.index()].is_some()
    }

    /// Install `track` for its kind, returning the source it replaces
    pub fn set(&self, track: LocalTrack) -> Option<LocalTrack> {
        let kind = track.kind();
        self.slots.write()[kind.index()].replace(track)
    }

    pub fn take(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.slots.write()[kind.index()].take()
    }

    /// Active sources in attach order
    #[must_use]
    pub fn active(&self) -> Vec<LocalTrack> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn active_kinds(&self) -> Vec<TrackKind> {
        self.active().iter().map(LocalTrack::kind).collect()
    }

    /// Voice flows only while neither muted nor deafened
    pub fn apply_voice_gate(&self, muted: bool, deafened: bool) {
        if let Some(voice) = self.get(TrackKind::Voice) {
            voice.set_enabled(!(muted || deafened));
        }
    }

    /// Attach every active source to `link` in attach order. Returns the
    /// number of slots that changed.
    pub async fn attach_all(&self, link: &PeerLink) -> Result<usize> {
        let mut changed = 0;
        for track in self.active() {
            if link.attach_track(track.kind(), &track).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Attach the current source of `kind` to every link
    pub async fn broadcast_attach(
        &self,
        kind: TrackKind,
        links: &[Arc<PeerLink>],
    ) -> Vec<(Arc<PeerLink>, Result<bool>)> {
        let Some(track) = self.get(kind) else {
            return Vec::new();
        };
        let results = join_all(links.iter().map(|link| {
            let track = track.clone();
            async move { (Arc::clone(link), link.attach_track(kind, &track).await) }
        }))
        .await;
        log_failures("attach", kind, &results);
        results
    }

    pub async fn broadcast_detach(
        &self,
        kind: TrackKind,
        links: &[Arc<PeerLink>],
    ) -> Vec<(Arc<PeerLink>, Result<bool>)> {
        let results = join_all(
            links
                .iter()
                .map(|link| async move { (Arc::clone(link), link.detach_track(kind).await) }),
        )
        .await;
        log_failures("detach", kind, &results);
        results
    }

    /// Swap the source of `kind` on every link without renegotiating
    pub async fn broadcast_replace(
        &self,
        kind: TrackKind,
        links: &[Arc<PeerLink>],
    ) -> Vec<(Arc<PeerLink>, Result<()>)> {
        let Some(track) = self.get(kind) else {
            return Vec::new();
        };
        let results = join_all(links.iter().map(|link| {
            let track = track.clone();
            async move { (Arc::clone(link), link.replace_track(kind, &track).await) }
        }))
        .await;
        log_failures("replace", kind, &results);
        results
    }

    /// Stop and forget every source
    pub fn stop_all(&self) {
        let tracks: Vec<LocalTrack> = self.slots.write().iter_mut().filter_map(Option::take).collect();
        for track in tracks {
            debug!(kind = %track.kind(), "Stopping local track");
            track.stop();
        }
    }
}

fn log_failures<T>(op: &str, kind: TrackKind, results: &[(Arc<PeerLink>, Result<T>)]) {
    for (link, result) in results {
        if let Err(e) = result {
            warn!(op, %kind, link_id = %link.id(), remote = %link.remote(), error = %e, "Track broadcast failed on link");
        }
    }
}
