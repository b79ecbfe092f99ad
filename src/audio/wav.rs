//! # WAV Envelope Codec
//!
//! Wraps raw little-endian PCM into the canonical 44-byte RIFF/WAVE container
//! that speech-to-text services accept as an uploaded file.
//!
//! ## Layout (all integers little-endian):
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | `"RIFF"`                                |
//! | 4      | 4    | 36 + data length                        |
//! | 8      | 4    | `"WAVE"`                                |
//! | 12     | 4    | `"fmt "`                                |
//! | 16     | 4    | 16 (PCM fmt chunk size)                 |
//! | 20     | 2    | 1 (PCM)                                 |
//! | 22     | 2    | channels                                |
//! | 24     | 4    | sample rate                             |
//! | 28     | 4    | byte rate                               |
//! | 32     | 2    | block align                             |
//! | 34     | 2    | bits per sample                         |
//! | 36     | 4    | `"data"`                                |
//! | 40     | 4    | data length                             |
//! | 44     | n    | PCM payload, byte for byte              |

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Size of the header written in front of every payload.
pub const WAV_HEADER_LEN: usize = 44;

/// PCM format parameters shared by the device stream, the codec and the
/// synthesis output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    /// Bytes per sample frame (all channels), or `None` if it doesn't fit the header field.
    pub fn block_align(&self) -> Option<u16> {
        self.channels.checked_mul(self.bits_per_sample).map(|bits| bits / 8)
    }

    /// Bytes per second of audio, or `None` if it doesn't fit the header field.
    pub fn byte_rate(&self) -> Option<u32> {
        self.sample_rate.checked_mul(u32::from(self.block_align()?))
    }

    /// Number of payload bytes covering `ms` milliseconds of audio.
    ///
    /// At the default format 500 ms is 16000 bytes. `None` on overflow.
    pub fn bytes_for_duration_ms(&self, ms: u64) -> Option<usize> {
        let bytes = u64::from(self.byte_rate()?).checked_mul(ms)? / 1000;
        usize::try_from(bytes).ok()
    }
}

/// Prepend a WAV header to `pcm` and return the complete envelope.
///
/// The payload is copied verbatim; an odd byte count is accepted and not
/// padded. Fails only if the payload cannot be described by the 32-bit
/// RIFF size fields or the buffer write fails.
pub fn wrap_pcm(pcm: &[u8], format: &AudioFormat) -> io::Result<Vec<u8>> {
    let data_len = u32::try_from(pcm.len())
        .ok()
        .filter(|len| *len <= u32::MAX - 36)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("PCM payload of {} bytes is too large for a RIFF container", pcm.len()),
            )
        })?;

    let (byte_rate, block_align) = format
        .byte_rate()
        .zip(format.block_align())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("audio format {:?} overflows the WAV header fields", format),
            )
        })?;

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    // RIFF chunk descriptor
    wav.write_all(b"RIFF")?;
    wav.write_u32::<LittleEndian>(36 + data_len)?;
    wav.write_all(b"WAVE")?;

    // fmt sub-chunk
    wav.write_all(b"fmt ")?;
    wav.write_u32::<LittleEndian>(16)?;
    wav.write_u16::<LittleEndian>(1)?;
    wav.write_u16::<LittleEndian>(format.channels)?;
    wav.write_u32::<LittleEndian>(format.sample_rate)?;
    wav.write_u32::<LittleEndian>(byte_rate)?;
    wav.write_u16::<LittleEndian>(block_align)?;
    wav.write_u16::<LittleEndian>(format.bits_per_sample)?;

    // data sub-chunk
    wav.write_all(b"data")?;
    wav.write_u32::<LittleEndian>(data_len)?;
    wav.write_all(pcm)?;

    Ok(wav)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::{Cursor, Read};

    fn read_tag(cursor: &mut Cursor<&[u8]>) -> [u8; 4] {
        let mut tag = [0u8; 4];
        cursor.read_exact(&mut tag).unwrap();
        tag
    }

    /// Every header field lands at its offset with the expected value.
    #[test]
    fn test_header_fields() {
        let pcm = vec![0x01u8; 32_000];
        let wav = wrap_pcm(&pcm, &AudioFormat::default()).unwrap();
        let mut cursor = Cursor::new(wav.as_slice());

        assert_eq!(&read_tag(&mut cursor), b"RIFF");
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 36 + 32_000);
        assert_eq!(&read_tag(&mut cursor), b"WAVE");
        assert_eq!(&read_tag(&mut cursor), b"fmt ");
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 16);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 16_000);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 32_000);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 16);
        assert_eq!(&read_tag(&mut cursor), b"data");
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 32_000);
        assert_eq!(cursor.position() as usize, WAV_HEADER_LEN);
    }

    /// The payload follows the header unchanged, including odd lengths.
    #[test]
    fn test_payload_preserved() {
        let pcm: Vec<u8> = (0..=255u8).cycle().take(1001).collect();
        let wav = wrap_pcm(&pcm, &AudioFormat::default()).unwrap();

        assert_eq!(wav.len(), WAV_HEADER_LEN + 1001);
        assert_eq!(&wav[WAV_HEADER_LEN..], pcm.as_slice());
    }

    /// An empty payload still produces a well-formed header.
    #[test]
    fn test_empty_payload() {
        let wav = wrap_pcm(&[], &AudioFormat::default()).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        assert_eq!(&wav[4..8], &36u32.to_le_bytes());
        assert_eq!(&wav[40..44], &0u32.to_le_bytes());
    }

    /// Derived header values follow the configured format.
    #[test]
    fn test_stereo_format_values() {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
        };
        let wav = wrap_pcm(&[0u8; 8], &format).unwrap();

        assert_eq!(&wav[22..24], &2u16.to_le_bytes());
        assert_eq!(&wav[28..32], &(44_100u32 * 4).to_le_bytes());
        assert_eq!(&wav[32..34], &4u16.to_le_bytes());
    }

    #[test]
    fn test_duration_to_bytes() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_for_duration_ms(500), Some(16_000));
        assert_eq!(format.bytes_for_duration_ms(1000), Some(32_000));
    }

    /// Formats and durations too large for the arithmetic report `None`.
    #[test]
    fn test_oversized_values_overflow_cleanly() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_for_duration_ms(1_000_000_000_000_000_000), None);

        let wide = AudioFormat {
            channels: 4096,
            ..AudioFormat::default()
        };
        assert_eq!(wide.block_align(), None);
        assert_eq!(wide.byte_rate(), None);
        let err = wrap_pcm(&[0u8; 4], &wide).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
