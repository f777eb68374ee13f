/// Audio buffer module for chunked microphone audio
///
/// Holds the sample ring shared between the capture callback and the
/// blocking chunk reader, plus the fixed-length `AudioChunk` type that the
/// rest of the pipeline works with.
/// Holds at least 3 seconds of 16kHz PCM audio (~96KB), more for long chunks.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::energy;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Ring buffer size: 3 seconds at 16kHz sample rate
pub const BUFFER_DURATION_SECS: usize = 3;
pub const SAMPLE_RATE: u32 = 16000;
pub const CHANNELS: u16 = 1;
pub const BUFFER_SIZE: usize = BUFFER_DURATION_SECS * SAMPLE_RATE as usize; // 48,000 samples

/// How long a blocked reader sleeps before re-checking the closed flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum AudioBufferError {
    #[error("Buffer closed with {0} samples left unread")]
    Closed(usize),

    #[error("Requested chunk of {0} samples exceeds buffer capacity of {1}")]
    ChunkTooLarge(usize, usize),
}

/// One fixed-size block of mono samples, the unit the loop processes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioChunk {
    samples: Vec<AudioSample>,
}

impl AudioChunk {
    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self { samples }
    }

    /// A chunk of `len` copies of `value`
    pub fn constant(value: AudioSample, len: usize) -> Self {
        Self::new(vec![value; len])
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square energy of the chunk
    pub fn rms(&self) -> f64 {
        energy::rms(&self.samples)
    }

    pub fn into_samples(self) -> Vec<AudioSample> {
        self.samples
    }
}

impl From<Vec<AudioSample>> for AudioChunk {
    fn from(samples: Vec<AudioSample>) -> Self {
        Self::new(samples)
    }
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Ring buffer for audio samples
///
/// The capture callback writes through the producer half and the loop reads
/// whole chunks through the consumer half. Readers block on a condition
/// variable tied to the consumer lock until enough samples arrive.
pub struct AudioBuffer {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    available: Condvar,
    closed: AtomicBool,
}

impl AudioBuffer {
    /// Create a buffer able to hold at least two chunks of `chunk_size`
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        Self::with_capacity(BUFFER_SIZE.max(chunk_size.saturating_mul(2)))
    }

    /// Create a buffer with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        debug!("Creating audio buffer with capacity: {} samples", capacity);

        let rb = HeapRb::<AudioSample>::new(capacity);
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Write audio samples to the buffer (non-blocking)
    ///
    /// Returns the number of samples successfully written.
    /// If buffer is full, oldest samples are overwritten.
    pub fn write(&self, samples: &[AudioSample]) -> usize {
        let mut producer = lock(&self.producer);

        let available_space = producer.vacant_len();
        let to_write = samples.len();

        if to_write > available_space {
            // Need to drop oldest samples to make room
            let to_drop = to_write - available_space;
            let mut consumer = lock(&self.consumer);
            let occupied = consumer.occupied_len();
            consumer.skip(to_drop.min(occupied));
            drop(consumer); // Release lock

            warn!(
                "Buffer full, dropping {} oldest samples to make room",
                to_drop
            );
        }

        // Anything beyond capacity can only be the newest tail
        let capacity = producer.capacity().get();
        let tail = &samples[samples.len().saturating_sub(capacity)..];
        let written = producer.push_slice(tail);
        drop(producer);

        trace!("Wrote {} samples to buffer", written);
        self.available.notify_all();

        to_write
    }

    /// Read exactly `count` samples, blocking until they are available
    ///
    /// Fails once the buffer has been closed and fewer than `count`
    /// samples remain.
    pub fn read_blocking(&self, count: usize) -> Result<Vec<AudioSample>, AudioBufferError> {
        let capacity = self.capacity();
        if count > capacity {
            return Err(AudioBufferError::ChunkTooLarge(count, capacity));
        }

        let mut consumer = lock(&self.consumer);

        while consumer.occupied_len() < count {
            if self.is_closed() {
                return Err(AudioBufferError::Closed(consumer.occupied_len()));
            }

            consumer = match self.available.wait_timeout(consumer, READ_POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let mut result = vec![0; count];
        let read = consumer.pop_slice(&mut result);
        result.truncate(read);

        trace!("Read {} samples from buffer", read);
        Ok(result)
    }

    /// Mark the buffer closed and wake any blocked reader
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
        debug!("Audio buffer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the number of samples currently in the buffer
    pub fn len(&self) -> usize {
        lock(&self.consumer).occupied_len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        lock(&self.consumer).capacity().get()
    }

}

// A panic on the other side of the lock leaves the ring itself intact.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_buffer_creation() {
        let buffer = AudioBuffer::for_chunk_size(1280);
        assert_eq!(buffer.capacity(), BUFFER_SIZE);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert!(!buffer.is_closed());
    }

    #[test]
    fn test_write_and_read() {
        let buffer = AudioBuffer::with_capacity(1000);
        let samples: Vec<i16> = (0..100).map(|i| i as i16).collect();

        let written = buffer.write(&samples);
        assert_eq!(written, 100);
        assert_eq!(buffer.len(), 100);

        let read = buffer.read_blocking(50).unwrap();
        assert_eq!(read.len(), 50);
        assert_eq!(buffer.len(), 50);
        assert_eq!(read[0], 0);
        assert_eq!(read[49], 49);
    }

    #[test]
    fn test_buffer_overflow_keeps_newest() {
        let buffer = AudioBuffer::with_capacity(10);

        buffer.write(&[1; 10]);
        buffer.write(&[2; 5]);
        assert_eq!(buffer.len(), 10);

        let data = buffer.read_blocking(10).unwrap();
        assert_eq!(&data[..5], &[1; 5]);
        assert_eq!(&data[5..], &[2; 5]);
    }

    #[test]
    fn test_write_larger_than_capacity() {
        let buffer = AudioBuffer::with_capacity(100);
        let samples: Vec<i16> = (0..150).map(|i| i as i16).collect();

        let written = buffer.write(&samples);
        assert_eq!(written, 150);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.read_blocking(1).unwrap(), vec![50]);
    }

    #[test]
    fn test_read_blocks_until_samples_arrive() {
        let buffer = Arc::new(AudioBuffer::with_capacity(4096));
        let writer = Arc::clone(&buffer);

        let handle = thread::spawn(move || {
            for _ in 0..4 {
                thread::sleep(Duration::from_millis(5));
                writer.write(&[7; 320]);
            }
        });

        let chunk = buffer.read_blocking(1280).unwrap();
        handle.join().unwrap();

        assert_eq!(chunk.len(), 1280);
        assert!(chunk.iter().all(|&s| s == 7));
    }

    #[test]
    fn test_closed_buffer_fails_short_read() {
        let buffer = AudioBuffer::with_capacity(100);
        buffer.write(&[1; 50]);
        buffer.close();

        match buffer.read_blocking(80) {
            Err(AudioBufferError::Closed(left)) => assert_eq!(left, 50),
            other => panic!("Expected Closed error, got {:?}", other),
        }

        // Whole chunks still drain after close
        assert_eq!(buffer.read_blocking(50).unwrap().len(), 50);
    }

    #[test]
    fn test_chunk_larger_than_capacity_is_rejected() {
        let buffer = AudioBuffer::with_capacity(100);
        assert!(matches!(
            buffer.read_blocking(101),
            Err(AudioBufferError::ChunkTooLarge(101, 100))
        ));
    }

    #[test]
    fn test_sized_for_chunk_longer_than_three_seconds() {
        let buffer = AudioBuffer::for_chunk_size(64000);
        assert_eq!(buffer.capacity(), 128000);

        let samples: Vec<i16> = (0..64000).map(|i| (i % 100) as i16).collect();
        buffer.write(&samples);

        let chunk = buffer.read_blocking(64000).unwrap();
        assert_eq!(chunk, samples);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chunk_rms() {
        let chunk = AudioChunk::constant(-300, 1280);
        assert_eq!(chunk.len(), 1280);
        assert_relative_eq!(chunk.rms(), 300.0, epsilon = 1e-9);
        assert!(AudioChunk::default().is_empty());
    }
}
