//! G.711 mu-law Encoding/Decoding
//!
//! Die Gegenseite erwartet PCMU (mu-law, 8kHz, Mono) als einzigen Codec.
//! Implementiert den Standard-Segmentalgorithmus nach ITU-T G.711.

/// Bias für die mu-law Segmentsuche
const BIAS: i16 = 0x84;

/// Maximale Amplitude vor dem Clipping
const CLIP: i16 = 32635;

/// Kodiert ein lineares 16-bit PCM Sample als mu-law Byte.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        // i16::MIN hat keinen positiven Gegenwert
        (sample as i32).unsigned_abs().min(CLIP as u32) as i16
    } else {
        sample.min(CLIP)
    };

    magnitude += BIAS;

    // Segment bestimmen (Exponent 0..7)
    let mut segment: u8 = 0;
    let mut probe = magnitude >> 7;
    while probe > 1 && segment < 7 {
        probe >>= 1;
        segment += 1;
    }

    let mantissa = ((magnitude >> (segment + 3)) & 0x0F) as u8;
    !(sign | (segment << 4) | mantissa)
}

/// Dekodiert ein mu-law Byte zurück zu linearem 16-bit PCM.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let segment = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;

    let magnitude = (((mantissa as i16) << 3) + BIAS) << segment;
    let magnitude = magnitude - BIAS;

    if sign != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Kodiert einen Frame von f32-Samples ([-1.0, 1.0]) als mu-law Bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| {
            let clamped = s.clamp(-1.0, 1.0);
            linear_to_ulaw((clamped * i16::MAX as f32) as i16)
        })
        .collect()
}

/// Dekodiert mu-law Bytes zu f32-Samples ([-1.0, 1.0]).
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| ulaw_to_linear(*b) as f32 / i16::MAX as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_round_trips_to_near_zero() {
        let decoded = ulaw_to_linear(linear_to_ulaw(0));
        assert!(decoded.abs() < 16, "decoded silence was {decoded}");
    }

    #[test]
    fn round_trip_error_is_bounded() {
        // mu-law ist logarithmisch: relativer Fehler bleibt klein,
        // absoluter Fehler wächst mit der Amplitude.
        for &sample in &[-32000i16, -12345, -100, 0, 77, 5000, 32000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample));
            let error = (decoded as i32 - sample as i32).abs();
            let bound = (sample as i32).abs() / 16 + 40;
            assert!(
                error <= bound,
                "sample {sample}: decoded {decoded}, error {error} > {bound}"
            );
        }
    }

    #[test]
    fn sign_is_preserved() {
        assert!(ulaw_to_linear(linear_to_ulaw(-8000)) < 0);
        assert!(ulaw_to_linear(linear_to_ulaw(8000)) > 0);
    }

    #[test]
    fn frame_encode_decode_lengths_match() {
        let frame = vec![0.25f32; 160];
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), 160);
        let decoded = decode_frame(&encoded);
        assert_eq!(decoded.len(), 160);
        for s in decoded {
            assert!((s - 0.25).abs() < 0.02);
        }
    }
}
