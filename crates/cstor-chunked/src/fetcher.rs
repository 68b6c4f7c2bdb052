//! Bounded-parallel range fetching.
//!
//! Missing ranges are grouped into requests of at most
//! `max_ranges_per_request` ranges and handed to `max_concurrent_streams`
//! worker threads over a bounded channel. Each worker calls
//! [`BlobSource::get_blob_at`] and feeds the delivered streams, one by one, to
//! the consumer together with the range they answer. Completion reports flow
//! back to the calling thread, which matches them to ranges by identity, not
//! by arrival order.
//!
//! The first failure cancels outstanding work, but the caller keeps draining
//! the result channel until every worker has exited, so no thread is left
//! blocked on a full channel.

use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::bounded;

use crate::error::{ChunkedError, Result};
use crate::source::{BlobSource, ImageSourceChunk};

/// Shared flag used to abort a running pull.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`ChunkedError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ChunkedError::Cancelled);
        }
        Ok(())
    }
}

/// Limits for one fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Worker threads, each with at most one request in flight.
    pub max_concurrent_streams: usize,
    /// Ranges per `get_blob_at` call.
    pub max_ranges_per_request: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 8,
            max_ranges_per_request: 64,
        }
    }
}

/// Counters of a completed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// `get_blob_at` calls issued.
    pub requests: u64,
    /// Ranges delivered.
    pub ranges: u64,
    /// Compressed bytes delivered.
    pub bytes: u64,
}

enum Report {
    Request,
    Done(ImageSourceChunk),
    Failed(Option<ImageSourceChunk>, ChunkedError),
}

/// Reader that refuses to deliver more than `limit` bytes and counts the rest.
struct BoundedStream<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
    truncated: bool,
}

impl Read for BoundedStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            self.truncated = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed with {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn deliver<C>(range: ImageSourceChunk, mut stream: Box<dyn Read + Send>, consume: &C) -> Result<()>
where
    C: Fn(ImageSourceChunk, &mut dyn Read) -> Result<()> + Sync,
{
    let mut bounded = BoundedStream {
        inner: &mut stream,
        remaining: range.length,
        truncated: false,
    };
    let consumed = consume(range, &mut bounded).and_then(|()| {
        // Whatever the consumer skipped still has to arrive.
        io::copy(&mut bounded, &mut io::sink())?;
        Ok(())
    });
    if let Err(e) = consumed {
        if bounded.truncated {
            return Err(ChunkedError::RemoteFetch(format!(
                "range {}+{}: stream closed early: {}",
                range.offset, range.length, e
            )));
        }
        return Err(e);
    }
    let mut probe = [0u8; 1];
    if stream.read(&mut probe)? != 0 {
        return Err(ChunkedError::RemoteFetch(format!(
            "range {}+{} delivered too many bytes",
            range.offset, range.length
        )));
    }
    Ok(())
}

fn run_request<C>(
    source: &dyn BlobSource,
    batch: &[ImageSourceChunk],
    cancel: &CancellationToken,
    consume: &C,
    report: &crossbeam_channel::Sender<Report>,
) where
    C: Fn(ImageSourceChunk, &mut dyn Read) -> Result<()> + Sync,
{
    let _ = report.send(Report::Request);
    let streams = match source.get_blob_at(batch) {
        Ok(s) => s,
        Err(e) => {
            let _ = report.send(Report::Failed(None, e));
            return;
        }
    };
    let mut streams = streams.fuse();
    for range in batch {
        if cancel.is_cancelled() {
            return;
        }
        let outcome = match streams.next() {
            Some(Ok(stream)) => deliver(*range, stream, consume),
            Some(Err(e)) => Err(e),
            None => Err(ChunkedError::RemoteFetch(format!(
                "no stream for range {}+{}",
                range.offset, range.length
            ))),
        };
        let msg = match outcome {
            Ok(()) => Report::Done(*range),
            Err(e) => Report::Failed(Some(*range), e),
        };
        if report.send(msg).is_err() {
            return;
        }
    }
}

/// Fetch `ranges` from `source`, handing each stream to `consume`.
///
/// `consume` runs on worker threads and receives a reader that yields exactly
/// the bytes of its range. Duplicate ranges are fetched once. Returns the
/// first error after all workers have stopped.
pub fn fetch_ranges<C>(
    source: &dyn BlobSource,
    ranges: &[ImageSourceChunk],
    options: &FetchOptions,
    cancel: &CancellationToken,
    consume: C,
) -> Result<FetchStats>
where
    C: Fn(ImageSourceChunk, &mut dyn Read) -> Result<()> + Sync,
{
    let mut seen = HashSet::new();
    let unique: Vec<ImageSourceChunk> = ranges
        .iter()
        .copied()
        .filter(|r| seen.insert(*r))
        .collect();
    let mut stats = FetchStats::default();
    if unique.is_empty() {
        return Ok(stats);
    }
    cancel.check()?;

    let per_request = options.max_ranges_per_request.max(1);
    let batches: Vec<&[ImageSourceChunk]> = unique.chunks(per_request).collect();
    let workers = options.max_concurrent_streams.max(1).min(batches.len());
    tracing::debug!(
        "fetching {} ranges in {} requests with {} workers",
        unique.len(),
        batches.len(),
        workers
    );

    let mut pending: HashSet<ImageSourceChunk> = unique.iter().copied().collect();
    let mut first_error: Option<ChunkedError> = None;

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = bounded::<&[ImageSourceChunk]>(workers);
        let (report_tx, report_rx) = bounded::<Report>(workers * 2);

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let consume = &consume;
            scope.spawn(move || {
                for batch in job_rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    run_request(source, batch, cancel, consume, &report_tx);
                }
            });
        }
        drop(job_rx);
        drop(report_tx);

        scope.spawn(move || {
            for batch in batches {
                if cancel.is_cancelled() || job_tx.send(batch).is_err() {
                    break;
                }
            }
        });

        for report in report_rx.iter() {
            match report {
                Report::Request => stats.requests += 1,
                Report::Done(range) => {
                    if pending.remove(&range) {
                        stats.ranges += 1;
                        stats.bytes += range.length;
                    }
                }
                Report::Failed(range, e) => {
                    if let Some(r) = range {
                        tracing::debug!("range {}+{} failed: {}", r.offset, r.length, e);
                    }
                    cancel.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
    });

    if let Some(e) = first_error {
        return Err(e);
    }
    cancel.check()?;
    if !pending.is_empty() {
        return Err(ChunkedError::RemoteFetch(format!(
            "{} ranges were never delivered",
            pending.len()
        )));
    }
    Ok(stats)
}
