use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use crate::byteorder::WriteBytesLe;
use mediapiped_macros::{ToBytes, w64_chunk};

// W64 GUIDs as defined in Sony Wave64 specification
pub const W64_RIFF_GUID: [u8; 16] = [
    0x72, 0x69, 0x66, 0x66, 0x2E, 0x91, 0xCF, 0x11, 0xA5, 0xD6, 0x28, 0xDB, 0x04, 0xC1, 0x00, 0x00,
];
pub const W64_WAVE_GUID: [u8; 16] = [
    0x77, 0x61, 0x76, 0x65, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB, 0x8A,
];
pub const W64_DATA_GUID: [u8; 16] = [
    0x64, 0x61, 0x74, 0x61, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB, 0x8A,
];

/// GUID and 64-bit size that open every W64 chunk.
const CHUNK_HEADER_LEN: u64 = 24;

pub trait W64Chunk {
    fn guid(&self) -> &[u8; 16];
    fn chunk_data(&self) -> Vec<u8>;

    /// Writes the chunk, padded to the 8-byte alignment W64 requires.
    fn write_all<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let data = self.chunk_data();
        writer.write_all(self.guid())?;
        writer.write_all(&(CHUNK_HEADER_LEN + data.len() as u64).to_le_bytes())?;
        writer.write_all(&data)?;

        let padding = (8 - data.len() % 8) % 8;
        writer.write_all(&[0u8; 8][..padding])?;
        Ok(())
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Pcm16 = 1,
    Float32 = 3,
}

impl SampleEncoding {
    pub fn bits_per_sample(self) -> u16 {
        match self {
            SampleEncoding::Pcm16 => 16,
            SampleEncoding::Float32 => 32,
        }
    }
}

#[derive(Debug, ToBytes)]
#[w64_chunk(b"fmt ")]
pub struct FormatChunk {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl FormatChunk {
    pub fn new(encoding: SampleEncoding, sample_rate: u32, channels: u16) -> Self {
        let bits_per_sample = encoding.bits_per_sample();
        let block_align = channels * (bits_per_sample / 8);
        Self {
            format_tag: encoding as u16,
            channels,
            sample_rate,
            byte_rate: sample_rate * block_align as u32,
            block_align,
            bits_per_sample,
        }
    }
}

/// Sony Wave64 file writer for interleaved 16-bit PCM or 32-bit float audio
pub struct WAVWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    format: FormatChunk,
    data_size_position: u64,
    file_size_position: u64,
    data_written: u64,
}

impl<W: Write + Seek> WAVWriter<W> {
    pub fn new(writer: W, encoding: SampleEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            writer: BufWriter::new(writer),
            format: FormatChunk::new(encoding, sample_rate, channels),
            data_size_position: 0,
            file_size_position: 0,
            data_written: 0,
        }
    }

    /// Write W64 file header
    pub fn write_header(&mut self) -> io::Result<()> {
        self.writer.write_all(&W64_RIFF_GUID)?;
        self.file_size_position = self.writer.stream_position()?;
        self.writer.write_all(&0u64.to_le_bytes())?; // File size (to be updated later)
        self.writer.write_all(&W64_WAVE_GUID)?;

        self.format.write_all(&mut self.writer)?;

        self.writer.write_all(&W64_DATA_GUID)?;
        self.data_size_position = self.writer.stream_position()?;
        self.writer.write_all(&0u64.to_le_bytes())?; // Data size (to be updated later)

        Ok(())
    }

    /// Appends interleaved little-endian samples. Must be whole sample frames.
    pub fn write_samples(&mut self, bytes: &[u8]) -> io::Result<()> {
        let block_align = self.format.block_align as usize;
        if block_align == 0 || bytes.len() % block_align != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} bytes is not a whole number of {block_align}-byte sample frames",
                    bytes.len()
                ),
            ));
        }
        self.writer.write_all(bytes)?;
        self.data_written += bytes.len() as u64;
        Ok(())
    }

    /// Finish writing and update file size headers
    pub fn finish(&mut self) -> io::Result<()> {
        let padding = ((8 - self.data_written % 8) % 8) as usize;
        self.writer.write_all(&[0u8; 8][..padding])?;
        self.writer.flush()?;

        let current_pos = self.writer.stream_position()?;

        // Update data chunk size (includes GUID + size = 24 bytes)
        self.writer.seek(SeekFrom::Start(self.data_size_position))?;
        let data_chunk_size = self.data_written + CHUNK_HEADER_LEN;
        self.writer.write_all(&data_chunk_size.to_le_bytes())?;

        // Update W64 file size
        self.writer.seek(SeekFrom::Start(self.file_size_position))?;
        self.writer.write_all(&current_pos.to_le_bytes())?;

        self.writer.seek(SeekFrom::Start(current_pos))?;
        self.writer.flush()?;

        Ok(())
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    pub fn data_written(&self) -> u64 {
        self.data_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const W64_FMT_GUID: [u8; 16] = [
        0x66, 0x6D, 0x74, 0x20, 0xF3, 0xAC, 0xD3, 0x11, 0x8C, 0xD1, 0x00, 0xC0, 0x4F, 0x8E, 0xDB,
        0x8A,
    ];

    #[test]
    fn test_w64_header_write() -> io::Result<()> {
        let mut writer = WAVWriter::new(Cursor::new(Vec::new()), SampleEncoding::Float32, 48000, 2);
        writer.write_header()?;
        let buffer = writer.into_inner()?.into_inner();

        assert_eq!(&buffer[0..16], &W64_RIFF_GUID);
        assert_eq!(&buffer[24..40], &W64_WAVE_GUID);
        assert_eq!(&buffer[40..56], &W64_FMT_GUID);
        // fmt chunk: 24-byte header + 16 bytes of format data
        assert_eq!(&buffer[56..64], &40u64.to_le_bytes());
        assert_eq!(&buffer[64..66], &3u16.to_le_bytes());
        assert_eq!(&buffer[68..72], &48000u32.to_le_bytes());
        assert_eq!(&buffer[72..76], &384000u32.to_le_bytes());
        assert_eq!(&buffer[80..96], &W64_DATA_GUID);
        Ok(())
    }

    #[test]
    fn test_w64_sample_write() -> io::Result<()> {
        let mut writer = WAVWriter::new(Cursor::new(Vec::new()), SampleEncoding::Pcm16, 44100, 2);
        writer.write_header()?;

        writer.write_samples(&[0x34, 0x12, 0x78, 0x56])?;
        assert!(writer.write_samples(&[0x01, 0x02]).is_err());
        assert_eq!(writer.data_written(), 4);

        writer.finish()?;
        let buffer = writer.into_inner()?.into_inner();

        assert_eq!(buffer.len(), 104 + 8);
        assert_eq!(&buffer[16..24], &(buffer.len() as u64).to_le_bytes());
        assert_eq!(&buffer[96..104], &28u64.to_le_bytes());
        assert_eq!(&buffer[104..108], &[0x34, 0x12, 0x78, 0x56]);
        Ok(())
    }
}
