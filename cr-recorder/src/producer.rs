use std::{io, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Slices a byte stream into chunks on a fixed cadence.
pub struct ChunkProducer<R> {
    source: R,
    interval: Duration,
}

impl<R> ChunkProducer<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Runs until end-of-stream, a stop signal or a refusal from `sink`.
    /// Whatever is buffered when the stream ends or stop is signalled becomes
    /// the final slice. Returns the number of chunks the sink accepted.
    pub async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        mut sink: impl FnMut(Bytes) -> bool,
    ) -> io::Result<u64> {
        let mut produced = 0u64;
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_BYTES);
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching_stop = true;

        if *stop.borrow_and_update() {
            return Ok(0);
        }

        loop {
            tokio::select! {
                biased;
                changed = stop.changed(), if watching_stop => {
                    match changed {
                        Ok(()) if *stop.borrow_and_update() => {
                            debug!("stop requested, flushing {} buffered bytes", buffer.len());
                            flush(&mut buffer, &mut sink, &mut produced);
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => watching_stop = false,
                    }
                }
                _ = ticker.tick() => {
                    if !flush(&mut buffer, &mut sink, &mut produced) {
                        break;
                    }
                }
                read = self.source.read_buf(&mut buffer) => match read {
                    Ok(0) => {
                        debug!("source ended, flushing {} buffered bytes", buffer.len());
                        flush(&mut buffer, &mut sink, &mut produced);
                        break;
                    }
                    Ok(_) => {
                        if buffer.capacity() == buffer.len() {
                            buffer.reserve(READ_BUFFER_BYTES);
                        }
                    }
                    Err(err) => {
                        flush(&mut buffer, &mut sink, &mut produced);
                        return Err(err);
                    }
                },
            }
        }
        Ok(produced)
    }
}

/// Hands the buffered bytes to the sink. Empty slices are dropped. Returns
/// `false` when the sink refused the slice.
fn flush(buffer: &mut BytesMut, sink: &mut impl FnMut(Bytes) -> bool, produced: &mut u64) -> bool {
    if buffer.is_empty() {
        return true;
    }
    let slice = buffer.split().freeze();
    if sink(slice) {
        *produced += 1;
        true
    } else {
        false
    }
}
