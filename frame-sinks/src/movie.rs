//! Raw uncompressed movie container.
//!
//! Writes a fixed-size chunk per frame: an f64 timestamp followed by the
//! packed image bytes. No compression, so writing is a straight memory
//! copy and individual frames remain randomly accessible. The frame count
//! in the header is patched on release.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lockstep_types::FrameEnvelope;

use crate::{Error, Result, VideoEncoder};

const FORMAT_VERSION: u32 = 3;

struct MovieHeader {
    width: u32,
    height: u32,
    row_bytes: usize,
    n_frames_pos: u64,
}

/// Writes the raw movie container.
///
/// The header is laid down on the first frame, which fixes the dimensions
/// and pixel format for the rest of the file.
pub struct RawMovieWriter<F: Write + Seek + Send> {
    f: F,
    header: Option<MovieHeader>,
    n_frames: u64,
    closed: bool,
}

impl RawMovieWriter<std::fs::File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(std::fs::File::create(path.as_ref())?))
    }
}

impl<F: Write + Seek + Send> RawMovieWriter<F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            header: None,
            n_frames: 0,
            closed: false,
        }
    }

    fn write_header(&mut self, frame: &FrameEnvelope) -> Result<()> {
        let image = &frame.payload;
        let bits_per_pixel = image.pixel_format.bits_per_pixel() as u32;
        let row_bytes = (image.width * bits_per_pixel / 8) as usize;
        let format = image.pixel_format.to_string();

        self.f.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        self.f.write_u32::<LittleEndian>(format.len() as u32)?;
        self.f.write_all(format.as_bytes())?;
        self.f.write_u32::<LittleEndian>(bits_per_pixel)?;
        self.f.write_u32::<LittleEndian>(image.height)?;
        self.f.write_u32::<LittleEndian>(image.width)?;
        let bytes_per_chunk = 8 + row_bytes as u64 * image.height as u64;
        self.f.write_u64::<LittleEndian>(bytes_per_chunk)?;
        let n_frames_pos = self.f.stream_position()?;
        self.f.write_u64::<LittleEndian>(0)?; // n_frames, patched on release

        self.header = Some(MovieHeader {
            width: image.width,
            height: image.height,
            row_bytes,
            n_frames_pos,
        });
        Ok(())
    }
}

impl<F: Write + Seek + Send> VideoEncoder for RawMovieWriter<F> {
    fn write(&mut self, frame: &FrameEnvelope) -> Result<()> {
        if self.closed {
            return Err(Error::EncoderError("movie already released".to_string()));
        }
        if self.header.is_none() {
            self.write_header(frame)?;
        }
        let header = self.header.as_ref().unwrap();
        let image = &frame.payload;
        if image.width != header.width || image.height != header.height {
            return Err(Error::FrameSizeChanged(format!(
                "movie is {}x{} but frame {} is {}x{}",
                header.width, header.height, frame.frame_number, image.width, image.height
            )));
        }
        if (image.stride as usize) < header.row_bytes {
            return Err(Error::FrameSizeChanged(format!(
                "stride {} smaller than packed row of {} bytes",
                image.stride, header.row_bytes
            )));
        }

        self.f.write_f64::<LittleEndian>(frame.synced_timestamp)?;
        for row in 0..image.height as usize {
            let start = row * image.stride as usize;
            self.f
                .write_all(&image.image_data[start..start + header.row_bytes])?;
        }
        self.n_frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(header) = &self.header {
            self.f.seek(SeekFrom::Start(header.n_frames_pos))?;
            self.f.write_u64::<LittleEndian>(self.n_frames)?;
            self.f.seek(SeekFrom::End(0))?;
        }
        self.f.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Header fields of a raw movie file.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieInfo {
    pub format: String,
    pub bits_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub n_frames: u64,
}

/// Reads the raw movie container back. Used for verification.
pub struct RawMovieReader<R: Read> {
    r: R,
    info: MovieInfo,
}

impl RawMovieReader<std::fs::File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(std::fs::File::open(path.as_ref())?)
    }
}

impl<R: Read> RawMovieReader<R> {
    pub fn new(mut r: R) -> Result<Self> {
        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::BadMovieHeader(format!(
                "unsupported version {version}"
            )));
        }
        let format_len = r.read_u32::<LittleEndian>()?;
        if format_len > 64 {
            return Err(Error::BadMovieHeader(format!(
                "implausible format string length {format_len}"
            )));
        }
        let mut format_raw = vec![0u8; format_len as usize];
        r.read_exact(&mut format_raw)?;
        let format = String::from_utf8_lossy(&format_raw).to_string();
        let bits_per_pixel = r.read_u32::<LittleEndian>()?;
        let height = r.read_u32::<LittleEndian>()?;
        let width = r.read_u32::<LittleEndian>()?;
        let _bytes_per_chunk = r.read_u64::<LittleEndian>()?;
        let n_frames = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            r,
            info: MovieInfo {
                format,
                bits_per_pixel,
                width,
                height,
                n_frames,
            },
        })
    }

    pub fn info(&self) -> &MovieInfo {
        &self.info
    }

    /// Read the next frame chunk: timestamp plus packed image bytes.
    pub fn next_frame(&mut self) -> Result<(f64, Vec<u8>)> {
        let timestamp = self.r.read_f64::<LittleEndian>()?;
        let row_bytes = (self.info.width * self.info.bits_per_pixel / 8) as usize;
        let mut data = vec![0u8; row_bytes * self.info.height as usize];
        self.r.read_exact(&mut data)?;
        Ok((timestamp, data))
    }
}
