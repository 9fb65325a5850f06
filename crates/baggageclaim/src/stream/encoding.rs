//! Stream codecs.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use baggageclaim_common::ClaimError;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

/// Compression applied to a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// gzip.
    Gzip,
    /// Zstandard.
    Zstd,
    /// Snappy framing.
    ///
    /// s2 readers accept what this writes, but incoming streams must also be
    /// Snappy-framed: s2-only blocks from an s2 writer fail to decode.
    S2,
    /// Uncompressed tar.
    Raw,
}

impl Encoding {
    /// Every supported encoding.
    pub const ALL: [Self; 4] = [Self::Gzip, Self::Zstd, Self::S2, Self::Raw];

    /// Wire name, as used in `Content-Encoding`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::S2 => "s2",
            Self::Raw => "raw",
        }
    }

    /// Wrap `reader` in the matching decoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder cannot be set up.
    pub fn decoder<'a>(self, reader: &'a mut dyn Read) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
            Self::S2 => Box::new(snap::read::FrameDecoder::new(reader)),
            Self::Raw => Box::new(reader),
        })
    }

    /// Run `body` against an encoder writing into `writer`, then finish the
    /// encoded stream.
    ///
    /// # Errors
    ///
    /// Returns the first error from `body` or from finishing the encoder.
    pub fn encode<F>(self, writer: &mut dyn Write, body: F) -> io::Result<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(writer, Compression::default());
                body(&mut encoder)?;
                encoder.finish()?;
            }
            Self::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, 0)?;
                body(&mut encoder)?;
                encoder.finish()?;
            }
            Self::S2 => {
                let mut encoder = snap::write::FrameEncoder::new(writer);
                body(&mut encoder)?;
                encoder.flush()?;
            }
            Self::Raw => body(writer)?,
        }
        Ok(())
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ClaimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "s2" => Ok(Self::S2),
            "raw" => Ok(Self::Raw),
            other => Err(ClaimError::UnsupportedEncoding {
                encoding: other.to_string(),
            }),
        }
    }
}

/// Guess the encoding of a local archive from its first bytes.
///
/// Anything that is neither gzip nor zstd is treated as a plain tar.
#[must_use]
pub fn sniff(header: &[u8]) -> Encoding {
    const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
    const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

    if header.starts_with(&GZIP_MAGIC) {
        Encoding::Gzip
    } else if header.starts_with(&ZSTD_MAGIC) {
        Encoding::Zstd
    } else {
        Encoding::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_encodings() {
        for encoding in Encoding::ALL {
            assert_eq!(encoding.as_str().parse::<Encoding>().unwrap(), encoding);
        }
        let err = "br".parse::<Encoding>().unwrap_err();
        assert!(matches!(err, ClaimError::UnsupportedEncoding { .. }));
    }

    #[test]
    fn codecs_round_trip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        for encoding in Encoding::ALL {
            let mut encoded = Vec::new();
            encoding
                .encode(&mut encoded, |w| w.write_all(&payload))
                .unwrap();

            let mut source = &encoded[..];
            let mut decoded = Vec::new();
            encoding
                .decoder(&mut source)
                .unwrap()
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, payload, "{encoding}");
        }
    }

    #[test]
    fn sniff_magic() {
        let mut gz = Vec::new();
        Encoding::Gzip.encode(&mut gz, |w| w.write_all(b"x")).unwrap();
        assert_eq!(sniff(&gz), Encoding::Gzip);

        let mut zst = Vec::new();
        Encoding::Zstd.encode(&mut zst, |w| w.write_all(b"x")).unwrap();
        assert_eq!(sniff(&zst), Encoding::Zstd);

        assert_eq!(sniff(b"plain tar header"), Encoding::Raw);
        assert_eq!(sniff(b""), Encoding::Raw);
    }
}
