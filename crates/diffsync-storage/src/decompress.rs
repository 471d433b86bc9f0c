//! Change-File Decompression
//!
//! The [`Decompressor`] capability does two things with a compressed change
//! file: a full self-check (`gzip -t` equivalent) used by verification, and
//! decompression into the applier's scratch area. It is a trait so the
//! pipeline can be driven with other codecs, or fakes, in tests.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::{Error, Result};

pub trait Decompressor: Send + Sync + std::fmt::Debug {
    /// Fully decodes `path` and discards the output. Any error means the
    /// file must not be trusted.
    fn verify(&self, path: &Path) -> Result<()>;

    /// Decodes `src` into a new file at `dst`, returning the decoded size.
    fn decompress(&self, src: &Path, dst: &Path) -> Result<u64>;
}

/// gzip (RFC 1952), including multi-member streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipDecompressor;

impl GzipDecompressor {
    fn open(path: &Path) -> Result<MultiGzDecoder<BufReader<File>>> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::integrity(path, "empty file"));
        }
        Ok(MultiGzDecoder::new(BufReader::new(file)))
    }
}

impl Decompressor for GzipDecompressor {
    fn verify(&self, path: &Path) -> Result<()> {
        let mut decoder = Self::open(path)?;
        io::copy(&mut decoder, &mut io::sink()).map_err(|e| Error::integrity(path, e))?;
        Ok(())
    }

    fn decompress(&self, src: &Path, dst: &Path) -> Result<u64> {
        let mut decoder = Self::open(src)?;
        let mut out = BufWriter::new(File::create(dst)?);
        let written = io::copy(&mut decoder, &mut out).map_err(|e| Error::integrity(src, e))?;
        out.flush()?;
        Ok(written)
    }
}
