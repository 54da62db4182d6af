//! Sequential readers over the message store.

use std::collections::VecDeque;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};
use crate::store::{MessageStore, StreamRecord};

/// Paging and polling settings for [`Stream`] readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// How long [`Stream::next`] waits before polling again once caught up.
    ///
    /// Default: 100ms
    poll_interval: Duration,

    /// Maximum records fetched per round trip, never zero.
    ///
    /// Default: 100
    page_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            page_size: 100,
        }
    }
}

impl StreamConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the page size. Zero is raised to one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

#[derive(Debug, Clone)]
enum Source {
    Stream(String),
    Global,
}

/// A cursor over one stream or over the global log.
///
/// Records are fetched in pages. Once a short page has been drained the
/// reader already knows it reached the end, so the next [`try_next`] reports
/// "caught up" without a round trip; the call after that fetches again.
///
/// ```ignore
/// let mut reader = store.open_global(0);
/// while reader.try_next().await? {
///     let record = reader.get()?;
///     println!("{} {}", record.global_offset, record.envelope.message().message_type());
/// }
/// ```
///
/// [`try_next`]: Stream::try_next
pub struct Stream<S: MessageStore> {
    store: S,
    source: Source,
    config: StreamConfig,
    next_offset: u64,
    page: VecDeque<StreamRecord>,
    current: Option<StreamRecord>,
    drained_short_page: bool,
    closed: bool,
}

impl<S: MessageStore> Stream<S> {
    /// Reader over a single stream, starting at `from_offset`.
    pub fn for_stream(store: S, stream: impl Into<String>, from_offset: u64) -> Self {
        Self::new(store, Source::Stream(stream.into()), from_offset)
    }

    /// Reader over the global log, starting at `from_offset`.
    pub fn global(store: S, from_offset: u64) -> Self {
        Self::new(store, Source::Global, from_offset)
    }

    fn new(store: S, source: Source, from_offset: u64) -> Self {
        let config = store.stream_config().clone();
        Self {
            store,
            source,
            config,
            next_offset: from_offset,
            page: VecDeque::new(),
            current: None,
            drained_short_page: false,
            closed: false,
        }
    }

    /// Advance to the next record without waiting.
    ///
    /// Returns `Ok(false)` when the reader is caught up.
    pub async fn try_next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::StreamClosed);
        }

        if self.advance() {
            return Ok(true);
        }

        if self.drained_short_page {
            self.drained_short_page = false;
            return Ok(false);
        }

        let limit = self.config.page_size;
        let records = match &self.source {
            Source::Stream(name) => {
                self.store
                    .fetch_stream_page(name, self.next_offset, limit)
                    .await?
            }
            Source::Global => self.store.fetch_global_page(self.next_offset, limit).await?,
        };
        trace!(
            from_offset = self.next_offset,
            fetched = records.len(),
            "Fetched stream page"
        );

        self.drained_short_page = !records.is_empty() && records.len() < limit as usize;
        self.page.extend(records);
        Ok(self.advance())
    }

    /// Advance to the next record, polling until one is available.
    ///
    /// Fails with [`Error::Cancelled`] once `cancel` fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.try_next().await? {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// The record at the cursor.
    ///
    /// Fails with [`Error::StreamNotPositioned`] before the first successful
    /// advance.
    pub fn get(&self) -> Result<&StreamRecord> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        self.current.as_ref().ok_or(Error::StreamNotPositioned)
    }

    /// Offset the next fetched record will have.
    ///
    /// Stream offset for a single stream, global offset for the global log.
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Release buffered records. Further reads fail with [`Error::StreamClosed`].
    pub fn close(&mut self) {
        self.page.clear();
        self.current = None;
        self.closed = true;
    }

    fn advance(&mut self) -> bool {
        let Some(record) = self.page.pop_front() else {
            return false;
        };
        self.next_offset = match self.source {
            Source::Stream(_) => record.stream_offset + 1,
            Source::Global => record.global_offset + 1,
        };
        self.current = Some(record);
        true
    }
}
