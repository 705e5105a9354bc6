use base64::Engine;

/// Sample rate of the mu-law audio exchanged with Twilio media streams.
pub const MULAW_SAMPLE_RATE: u32 = 8000;

/// Decodes a base64 media payload into raw mu-law bytes.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(payload)
}

/// Encodes raw mu-law bytes into a base64 media payload.
pub fn encode_payload(audio: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(audio)
}

/// Number of 8-bit samples covering `millis` milliseconds at `sample_rate`.
pub fn samples_for_millis(millis: u32, sample_rate: u32) -> usize {
    (sample_rate as usize * millis as usize) / 1000
}

/// Drops the first `millis` milliseconds of 8-bit audio.
///
/// Clips shorter than the trim window come back empty.
pub fn trim_leading(audio: &[u8], millis: u32, sample_rate: u32) -> &[u8] {
    let skip = samples_for_millis(millis, sample_rate);
    if skip >= audio.len() {
        tracing::debug!(
            "clip of {} bytes shorter than {}ms trim window",
            audio.len(),
            millis
        );
        return &[];
    }
    &audio[skip..]
}
