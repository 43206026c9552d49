//! Property-based tests for timestamp normalization, the bounded queue and
//! ADTS header synthesis.

use std::thread;

use proptest::prelude::*;

use mediapipe::process::reformat::{
    ADTS_HEADER_LEN, ADTS_SAMPLE_RATES, AdtsConfig, SampleRatePolicy, parse_adts_header,
};
use mediapipe::structs::stream::{AudioFormat, SampleFormat};
use mediapipe::utils::errors::ReformatError;
use mediapipe::utils::queue::{QueueConfig, TryPop, bounded};
use mediapipe::utils::timing::{NANOS_PER_SECOND, TimeBase, denormalize, normalize};

// =============================================================================
// Timestamp Normalizer
// =============================================================================

proptest! {
    #[test]
    fn normalize_is_monotonic(
        num in 1i64..=1001,
        den in 1i64..=1_000_000,
        start in -1_000_000_000i64..1_000_000_000,
        step in 0i64..1_000_000,
    ) {
        let tb = TimeBase::new(num, den).unwrap();
        let a = normalize(Some(start), tb).unwrap();
        let b = normalize(Some(start + step), tb).unwrap();
        prop_assert!(a <= b);
    }

    #[test]
    fn normalize_preserves_ratio(
        num in 1i64..=1001,
        den in 1i64..=1_000_000,
        a in -1_000_000_000i64..1_000_000_000,
        b in -1_000_000_000i64..1_000_000_000,
    ) {
        let tb = TimeBase::new(num, den).unwrap();
        let na = normalize(Some(a), tb).unwrap().nanos() as i128;
        let nb = normalize(Some(b), tb).unwrap().nanos() as i128;

        let exact = (a as i128 - b as i128) * num as i128 * NANOS_PER_SECOND as i128;
        let diff = (na - nb) * den as i128;
        prop_assert!((diff - exact).abs() <= den as i128);
    }

    #[test]
    fn denormalize_recovers_raw_ticks(
        num in 1i64..=1001,
        den in 1i64..=1_000_000,
        raw in -1_000_000_000i64..1_000_000_000,
    ) {
        let tb = TimeBase::new(num, den).unwrap();
        let back = denormalize(normalize(Some(raw), tb).unwrap(), tb);
        prop_assert!((back - raw).abs() <= 1);
    }
}

// =============================================================================
// Bounded Queue
// =============================================================================

proptest! {
    #[test]
    fn blocking_queue_delivers_everything_in_order(
        capacity in 1usize..8,
        items in prop::collection::vec(any::<u32>(), 0..200),
    ) {
        let (producer, consumer) = bounded(QueueConfig::blocking(capacity));
        let sent = items.clone();
        let handle = thread::spawn(move || {
            for item in sent {
                producer.push(item);
            }
        });

        let mut received = Vec::new();
        while let Ok(item) = consumer.pop() {
            received.push(item);
        }
        handle.join().unwrap();

        prop_assert_eq!(received, items);
        prop_assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn drop_oldest_keeps_the_newest(
        capacity in 1usize..16,
        extra in 1usize..64,
    ) {
        let (producer, consumer) = bounded(QueueConfig::drop_oldest(capacity));
        let total = capacity + extra;
        for n in 0..total {
            producer.push(n);
        }
        producer.closer().close();

        let mut received = Vec::new();
        while let TryPop::Item(item) = consumer.try_pop() {
            received.push(item);
        }

        prop_assert_eq!(received, (extra..total).collect::<Vec<_>>());
        prop_assert_eq!(consumer.dropped(), extra as u64);
        prop_assert!(consumer.pop().is_err());
    }
}

// =============================================================================
// ADTS Header Synthesis
// =============================================================================

proptest! {
    #[test]
    fn adts_frame_length_covers_header_and_payload(
        rate_index in 0usize..13,
        channels in 1u16..=6,
        profile in 1u8..=4,
        payload_len in 0usize..=(8191 - ADTS_HEADER_LEN),
    ) {
        let format = AudioFormat {
            sample_rate: ADTS_SAMPLE_RATES[rate_index],
            channels,
            sample_format: SampleFormat::F32,
            profile: Some(profile),
        };
        let config = AdtsConfig::from_format(&format, SampleRatePolicy::Reject).unwrap();
        let header = config.synthesize_header(payload_len).unwrap();

        let (parsed, frame_len) = parse_adts_header(&header).unwrap();
        prop_assert_eq!(frame_len, payload_len + ADTS_HEADER_LEN);
        prop_assert_eq!(parsed, config);
    }

    #[test]
    fn adts_rejects_oversized_frames(payload_len in (8191 - ADTS_HEADER_LEN + 1)..20_000usize) {
        let config = AdtsConfig::new(2, 3, 2).unwrap();
        prop_assert_eq!(
            config.synthesize_header(payload_len),
            Err(ReformatError::FrameTooLarge(payload_len + ADTS_HEADER_LEN))
        );
    }
}
