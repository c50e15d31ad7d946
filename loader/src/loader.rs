//! This module provides the segment loader: a concurrent fetch phase joined before an ordered delivery phase.

use std::num::NonZeroUsize;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;

use crate::fetch::{Fetch, FetchError};
use crate::sink::{AppendError, Sink};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to fetch `{address}`")]
    Fetch {
        address: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to append chunk `{chunk}` (#{position})")]
    Append {
        position: usize,
        chunk: String,
        #[source]
        source: AppendError,
    },
}

/// Fetched buffers awaiting delivery, indexed by the position of their chunk in the requested sequence.
///
/// Keying by position rather than by name lets duplicated chunk names be fetched and delivered independently, and
/// never relies on the completion order of the fetches.
#[derive(Debug)]
struct PendingSet {
    buffers: Vec<Option<Bytes>>,
}

impl PendingSet {
    fn new(len: usize) -> Self {
        Self { buffers: vec![None; len] }
    }

    fn insert(&mut self, position: usize, buffer: Bytes) {
        let previous = self.buffers[position].replace(buffer);

        debug_assert!(previous.is_none(), "chunk #{position} fetched twice");
    }

    fn is_complete(&self) -> bool {
        self.buffers.iter().all(Option::is_some)
    }

    /// Return the buffers in delivery order.
    fn into_ordered(self) -> impl Iterator<Item = Bytes> {
        debug_assert!(self.is_complete());

        self.buffers.into_iter().flatten()
    }
}

/// Segment loader.
///
/// Fetches a sequence of named chunks concurrently, then delivers them to a [`Sink`] one at a time, in the requested
/// order, each append being acknowledged before the next one is issued.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # let dir = tempfile::tempdir().unwrap();
/// # std::fs::create_dir(dir.path().join("media")).unwrap();
/// # for (name, len) in [("init", 8), ("seg1", 16), ("seg2", 16)] {
/// #     std::fs::write(dir.path().join(format!("media/{name}.mp4")), vec![0; len]).unwrap();
/// # }
/// # use segment_loader::{FsFetcher, MemorySourceBuffer, SegmentLoader};
/// let loader = SegmentLoader::new(FsFetcher::new(dir.path().to_path_buf()));
/// let mut sb = MemorySourceBuffer::new();
///
/// loader.fetch_and_load(&mut sb, "/media/", ["init", "seg1", "seg2"], ".mp4").await.unwrap();
///
/// assert_eq!(sb.append_count(), 3);
/// assert_eq!(sb.buffered_len(), 40);
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct SegmentLoader<F> {
    fetcher: F,
    max_in_flight: Option<NonZeroUsize>,
}

impl<F: Fetch> SegmentLoader<F> {
    /// Create a new `SegmentLoader` with no limit on the number of concurrent fetches.
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            max_in_flight: None,
        }
    }

    /// Build a new `SegmentLoader` fetching at most `max` chunks at the same time.
    #[inline]
    pub fn with_max_in_flight(self, max: NonZeroUsize) -> Self {
        Self {
            max_in_flight: Some(max),
            ..self
        }
    }

    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    #[inline]
    pub fn max_in_flight(&self) -> Option<NonZeroUsize> {
        self.max_in_flight
    }

    /// Fetch every `prefix + chunk + suffix` address, then append the fetched buffers to `sink` in `chunks` order.
    ///
    /// All fetches are awaited before the first append: if any of them fails, nothing is appended. Appends are then
    /// issued one at a time, and the first failing one stops the sequence, leaving previous appends applied.
    ///
    /// The sink is exclusively borrowed for the whole operation, since interleaving appends from concurrent loads
    /// would break their ordering.
    pub async fn fetch_and_load<S, I>(&self, sink: &mut S, prefix: &str, chunks: I, suffix: &str) -> Result<(), Error>
    where
        S: Sink + ?Sized,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let chunks: Vec<I::Item> = chunks.into_iter().collect();

        tracing::debug!("Fetching {} chunk(s) from `{prefix}*{suffix}`...", chunks.len());

        let pending = self.fetch_all(prefix, &chunks, suffix).await?;

        tracing::debug!("Loading {} chunk(s)...", chunks.len());

        for (position, (chunk, buffer)) in chunks.iter().zip(pending.into_ordered()).enumerate() {
            let chunk: &str = chunk.as_ref();

            tracing::trace!("Appending chunk `{chunk}` (#{position}, {} bytes)...", buffer.len());

            if let Err(source) = sink.append_and_await(buffer).await {
                tracing::debug!("Failed to append chunk `{chunk}` (#{position}): {source}");

                return Err(Error::Append {
                    position,
                    chunk: chunk.to_owned(),
                    source,
                });
            }
        }

        tracing::debug!("Loaded {} chunk(s)", chunks.len());

        Ok(())
    }

    /// Fetch all chunks concurrently and join them.
    ///
    /// Outstanding fetches are dropped as soon as one of them fails.
    async fn fetch_all(&self, prefix: &str, chunks: &[impl AsRef<str>], suffix: &str) -> Result<PendingSet, Error> {
        let limit = self.max_in_flight.map_or(chunks.len(), NonZeroUsize::get).max(1);

        let mut fetches = stream::iter(chunks.iter().enumerate())
            .map(|(position, chunk)| {
                let address = [prefix, chunk.as_ref(), suffix].concat();

                async move {
                    tracing::trace!("Fetching chunk #{position} from `{address}`...");

                    let result = self.fetcher.fetch(&address).await;
                    let buffer = result.map_err(|source| Error::Fetch { address, source })?;

                    Ok::<_, Error>((position, buffer))
                }
            })
            .buffer_unordered(limit);

        let mut pending = PendingSet::new(chunks.len());

        while let Some((position, buffer)) = fetches.try_next().await? {
            pending.insert(position, buffer);
        }

        Ok(pending)
    }
}
