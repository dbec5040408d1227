//! Compression autodetection and stream wrapping (§4.1).

use anyhow::{Result, bail};
use flate2::read::GzDecoder;
use std::io::Read;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gz,
    Xz,
    Zst,
}

const GZ_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZST_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Detect by magic bytes first, falling back to the filename extension so
/// a renamed archive still round-trips. Mismatch between the two is not
/// itself an error: magic wins.
pub fn detect(name: &str, head: &[u8]) -> Compression {
    if head.starts_with(&GZ_MAGIC) {
        return Compression::Gz;
    }
    if head.len() >= 6 && head[..6] == XZ_MAGIC {
        return Compression::Xz;
    }
    if head.len() >= 4 && head[..4] == ZST_MAGIC {
        return Compression::Zst;
    }
    if name.ends_with(".gz") || name.ends_with(".tgz") {
        Compression::Gz
    } else if name.ends_with(".xz") {
        Compression::Xz
    } else if name.ends_with(".zst") {
        Compression::Zst
    } else {
        Compression::None
    }
}

/// Wrap a reader with the decompressor matching `kind`. Errors surface as
/// `ErrBadCompression` equivalents via the caller's context.
pub fn wrap_reader<'a>(kind: Compression, inner: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
    match kind {
        Compression::None => Ok(inner),
        Compression::Gz => Ok(Box::new(GzDecoder::new(inner))),
        Compression::Xz => Ok(Box::new(XzDecoder::new(inner))),
        Compression::Zst => match ZstdDecoder::new(inner) {
            Ok(d) => Ok(Box::new(d)),
            Err(e) => bail!("bad zstd stream: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_wins_over_mismatched_extension() {
        assert_eq!(detect("bundle.xz", &GZ_MAGIC), Compression::Gz);
    }

    #[test]
    fn falls_back_to_extension_with_short_head() {
        assert_eq!(detect("bundle.zst", &[]), Compression::Zst);
        assert_eq!(detect("bundle.tar", &[]), Compression::None);
    }
}
