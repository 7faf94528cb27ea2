//! Lock-free SPSC ring buffer between the input device callback and the
//! capture thread.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half, held by the input device callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the capture thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^18 = 262 144 f32 samples ≈ 5.5 s at 48 kHz.
/// The capture thread drains every few milliseconds, so this only has to
/// absorb scheduler hiccups, not long stalls.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_capture_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_flow_through_in_order() {
        let (mut producer, mut consumer) = create_capture_ring();
        assert_eq!(producer.push_slice(&[0.1, 0.2, 0.3]), 3);
        let mut out = [0f32; 4];
        assert_eq!(consumer.pop_slice(&mut out), 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
        assert!(consumer.is_empty());
    }
}
