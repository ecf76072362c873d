//! Pushing a set of per-platform images as one multi-architecture tag.
//!
//! Everything except the tag is content addressed: layers, configs and
//! per-platform manifests are pushed by digest and are invisible to anyone
//! pulling the tag. Base layers the target repository lacks are copied from
//! the base source. The index goes last and is the only write that touches
//! the tag, so a run that fails or is cancelled part way leaves the tag
//! exactly as it was.
//!
//! Every write asks the [`SessionKeeper`] for its session, so a token that
//! lapses during a long upload is renewed rather than failing the push.

use std::collections::HashSet;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build::{BaseError, BaseSource, ImageArtifact};
use crate::oci::{Blob, Digest, ImageIndex, MEDIA_TYPE_INDEX, OciError, PlatformSpec};
use crate::registry::{RegistryError, SessionKeeper};

#[derive(Debug, Error)]
pub enum PublishError {
  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Oci(#[from] OciError),

  #[error("failed to copy base layer: {0}")]
  Base(#[from] BaseError),

  #[error("nothing to publish")]
  Empty,

  #[error("publish cancelled before the tag was written")]
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
  pub index_digest: Digest,
  pub blobs_pushed: usize,
  pub blobs_skipped: usize,
  /// Base layers copied from the base source, included in `blobs_pushed`.
  pub base_blobs_copied: usize,
}

/// Where a blob's bytes come from.
enum BlobData<'a> {
  Built(&'a [u8]),
  Base,
}

/// The index listing `images`, one entry per platform, in the given order.
pub fn build_index(images: &[&ImageArtifact]) -> Result<Blob, OciError> {
  let manifests = images
    .iter()
    .map(|image| {
      let mut entry = image.manifest.descriptor.clone();
      entry.platform = Some(PlatformSpec::from(&image.platform));
      entry
    })
    .collect();
  Blob::from_json(MEDIA_TYPE_INDEX, &ImageIndex::new(manifests))
}

/// Push `images` and point `tag` at their index.
pub async fn publish(
  keeper: &SessionKeeper,
  base: &dyn BaseSource,
  tag: &str,
  images: &[&ImageArtifact],
  cancel: &CancellationToken,
) -> Result<PublishOutcome, PublishError> {
  if images.is_empty() {
    return Err(PublishError::Empty);
  }
  let index = build_index(images)?;
  let registry = keeper.registry();

  let mut seen: HashSet<Digest> = HashSet::new();
  let mut pushed = 0;
  let mut skipped = 0;
  let mut copied = 0;

  for image in images {
    let blobs = image
      .base
      .layers
      .iter()
      .map(|l| (&l.descriptor.digest, BlobData::Base))
      .chain(
        image
          .layers
          .iter()
          .map(|l| (&l.descriptor.digest, BlobData::Built(l.data.as_slice()))),
      )
      .chain(std::iter::once((
        &image.config.descriptor.digest,
        BlobData::Built(image.config.data.as_slice()),
      )));

    for (digest, data) in blobs {
      if cancel.is_cancelled() {
        return Err(PublishError::Cancelled);
      }
      if !seen.insert(digest.clone()) {
        continue;
      }
      let session = keeper.session().await?;
      if registry.blob_exists(&session, digest).await? {
        debug!(%digest, "blob already present");
        skipped += 1;
        continue;
      }
      match data {
        BlobData::Built(data) => registry.push_blob(&session, digest, data).await?,
        BlobData::Base => {
          let data = base.layer(&image.base, digest).await?;
          // the read may have outlived the session
          let session = keeper.session().await?;
          registry.push_blob(&session, digest, &data).await?;
          debug!(%digest, from = %image.base.repository, "copied base layer");
          copied += 1;
        }
      }
      pushed += 1;
    }

    let digest = image.manifest_digest();
    let session = keeper.session().await?;
    let stored = registry
      .push_manifest(&session, digest.as_str(), &image.manifest.descriptor.media_type, &image.manifest.data)
      .await?;
    if stored != *digest {
      return Err(
        RegistryError::DigestMismatch {
          expected: digest.to_string(),
          actual: stored.to_string(),
        }
        .into(),
      );
    }
    debug!(platform = %image.platform, %digest, "pushed platform manifest");
  }

  if cancel.is_cancelled() {
    return Err(PublishError::Cancelled);
  }

  let session = keeper.session().await?;
  let index_digest = registry.push_manifest(&session, tag, MEDIA_TYPE_INDEX, &index.data).await?;
  info!(tag, digest = %index_digest, platforms = images.len(), "published index");

  Ok(PublishOutcome {
    index_digest,
    blobs_pushed: pushed,
    blobs_skipped: skipped,
    base_blobs_copied: copied,
  })
}
