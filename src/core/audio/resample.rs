//! Minimal linear resampler for the switch→recognition rate mismatch.
//!
//! The switch delivers 8 kHz signed 16-bit little-endian mono; the
//! recognition backend expects 16 kHz. Linear interpolation is plenty for
//! speech recognition input.

/// Resample signed 16-bit LE mono PCM between sample rates.
pub fn resample_pcm16(input: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || input.len() < 4 {
        return input.to_vec();
    }

    let samples: Vec<i16> = input
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = ((samples.len() as f64) * ratio) as usize;
    let mut out = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src = i as f64 / ratio;
        let idx = src as usize;
        let frac = src - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let value = (a + (b - a) * frac) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_identity_when_rates_match() {
        let input = to_bytes(&[1, 2, 3, 4]);
        assert_eq!(resample_pcm16(&input, 8000, 8000), input);
    }

    #[test]
    fn test_upsampling_doubles_length() {
        let input = to_bytes(&[0, 100, 200, 300]);
        let output = resample_pcm16(&input, 8000, 16000);
        assert_eq!(output.len(), input.len() * 2);
    }

    #[test]
    fn test_interpolated_midpoints() {
        let input = to_bytes(&[0, 100]);
        let output = resample_pcm16(&input, 8000, 16000);
        let samples: Vec<i16> = output
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], 50);
    }
}
